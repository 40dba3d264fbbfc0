//! A build and test assist program. To show the usage, run
//!
//! ```shell
//! cargo xtask
//! ```

use clap::{Parser, Subcommand};
use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
};

type DynError = Box<dyn std::error::Error>;

const TARGET: &str = "x86_64-unknown-none";

#[derive(Parser)]
#[command(author, about, long_about = None)]
struct Cli {
    /// Build the hypervisor with the release profile
    #[arg(short, long)]
    release: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the hypervisor kernel for the bare-metal target
    Build,
    /// Build a bootable GRUB ISO with a guest kernel and initramfs
    Iso(GuestImages),
    /// Build the ISO and boot it under QEMU with KVM
    Run(GuestImages),
}

#[derive(clap::Args)]
struct GuestImages {
    /// The Linux bzImage the hypervisor will boot
    #[arg(long)]
    kernel: PathBuf,

    /// The initramfs handed to that kernel
    #[arg(long)]
    initrd: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let result = match &cli.command {
        Commands::Build => build_hypervisor(cli.release).map(|_| ()),
        Commands::Iso(images) => build_iso(images, cli.release).map(|_| ()),
        Commands::Run(images) => run_qemu(images, cli.release),
    };
    if let Err(e) = result {
        eprintln!("{e}");
        std::process::exit(-1);
    }
}

fn project_root_dir() -> PathBuf {
    // Get the path to the xtask directory and resolve its parent directory.
    let root_dir = Path::new(&env!("CARGO_MANIFEST_DIR"))
        .ancestors()
        .nth(1)
        .unwrap()
        .to_path_buf();
    fs::canonicalize(root_dir).unwrap()
}

/// Builds the `mhv` kernel and returns the path of the ELF image.
fn build_hypervisor(release: bool) -> Result<PathBuf, DynError> {
    // Building mhv only is important because we are running xtask, which
    // cannot be overwritten while running.
    let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_string());
    let mut command = Command::new(cargo);
    let _ = command.args(["build", "--package", "mhv", "--target", TARGET]);
    if release {
        let _ = command.arg("--release");
    }
    let ok = command.current_dir(project_root_dir()).status()?.success();
    if !ok {
        Err("cargo build failed")?;
    }

    let mut elf = project_root_dir();
    elf.extend(&["target", TARGET, if release { "release" } else { "debug" }, "mhv"]);
    Ok(elf)
}

/// Stages the kernel and both guest images into a GRUB rescue ISO. The
/// module command lines are what the hypervisor greps for at boot.
fn build_iso(images: &GuestImages, release: bool) -> Result<PathBuf, DynError> {
    const GRUB_CFG: &str = "set timeout=0
set default=0

menuentry \"mhv\" {
    multiboot2 /boot/mhv
    module2 /boot/bzImage linux
    module2 /boot/initramfs.img initramfs
    boot
}
";

    let elf = build_hypervisor(release)?;

    let staging = project_root_dir().join("target").join("iso");
    let boot_dir = staging.join("boot");
    let grub_dir = boot_dir.join("grub");
    fs::create_dir_all(&grub_dir)?;
    let _ = fs::copy(&elf, boot_dir.join("mhv"))?;
    let _ = fs::copy(&images.kernel, boot_dir.join("bzImage"))?;
    let _ = fs::copy(&images.initrd, boot_dir.join("initramfs.img"))?;
    fs::write(grub_dir.join("grub.cfg"), GRUB_CFG)?;

    let iso = project_root_dir().join("target").join("mhv.iso");
    let output = Command::new("grub-mkrescue")
        .arg("-o")
        .arg(&iso)
        .arg(&staging)
        .output()?;
    if !output.status.success() {
        Err(format!("grub-mkrescue failed: {output:#?}"))?;
    }
    Ok(iso)
}

/// Boots the ISO under QEMU. VMX inside the guest needs KVM and the host
/// CPU model.
fn run_qemu(images: &GuestImages, release: bool) -> Result<(), DynError> {
    let iso = build_iso(images, release)?;
    let ok = Command::new("qemu-system-x86_64")
        .args(["-enable-kvm", "-cpu", "host,+vmx"])
        .args(["-m", "4096"])
        .args(["-serial", "stdio", "-display", "none"])
        .args(["-no-reboot"])
        .arg("-cdrom")
        .arg(&iso)
        .status()?
        .success();
    if !ok {
        Err("qemu-system-x86_64 failed")?;
    }
    Ok(())
}
