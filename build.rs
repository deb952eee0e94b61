// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

fn package_list(help: &'static str, required: bool) -> Arg {
    Arg::new("packages")
        .num_args(1..)
        .required(required)
        .help(help)
}

fn build_cli() -> Command {
    Command::new("nest")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Nest Contributors")
        .about("Package manager with dependency resolution and rollback-safe transactions")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .default_value("/etc/nest/config.toml")
                .global(true)
                .help("Configuration file"),
        )
        .arg(
            Arg::new("root")
                .short('r')
                .long("root")
                .value_name("DIR")
                .global(true)
                .help("Operate on another root directory"),
        )
        .arg(
            Arg::new("yes")
                .short('y')
                .long("yes")
                .action(ArgAction::SetTrue)
                .global(true)
                .help("Do not ask for confirmation"),
        )
        .subcommand(
            Command::new("pull")
                .about("Synchronize repository metadata")
                .arg(Arg::new("repository").help("Repository name (syncs all if omitted)"))
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Sync even if the metadata hasn't expired"),
                ),
        )
        .subcommand(
            Command::new("install")
                .about("Install packages, e.g. `app`, `lib>=2.0` or `stable::sys-libs/zlib`")
                .arg(package_list("Packages to install", true)),
        )
        .subcommand(
            Command::new("uninstall")
                .about("Uninstall packages")
                .arg(package_list("Packages to uninstall", true)),
        )
        .subcommand(
            Command::new("upgrade")
                .about("Upgrade installed packages (all if none are given)")
                .arg(package_list("Packages to upgrade", false)),
        )
        .subcommand(Command::new("list").about("List installed packages"))
        .subcommand(
            Command::new("orphans")
                .about("List installed packages nothing explicit depends on anymore"),
        )
        .subcommand(Command::new("history").about("Show transaction history"))
        .subcommand(
            Command::new("info")
                .about("Show the metadata and installed version of a package")
                .arg(Arg::new("package").required(true).help("Package name")),
        )
        .subcommand(
            Command::new("completions")
                .about("Generate shell completion scripts")
                .arg(
                    Arg::new("shell")
                        .required(true)
                        .value_parser(["bash", "elvish", "fish", "powershell", "zsh"])
                        .help("Shell type"),
                ),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Create man directory
    let out_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let man_dir = out_dir.join("man");
    fs::create_dir_all(&man_dir).expect("Failed to create man directory");

    // Generate main man page
    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();
    man.render(&mut buffer).expect("Failed to render man page");

    let man_path = man_dir.join("nest.1");
    fs::write(&man_path, buffer).expect("Failed to write man page");
}
