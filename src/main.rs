mod cli;

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use iop_installer::autorun::{self, AutorunEntry};
use iop_installer::certificate::PfxCertificateRequest;
use iop_installer::components::ComponentLayout;
use iop_installer::config::InstallerConfig;
use iop_installer::port_check::PortReachabilityChecker;
use iop_installer::process::ManagedProcess;
use iop_installer::seed::SeedNodeClient;
use iop_installer::system::{self, SystemTools};
use iop_installer::wizard::{self, ConsolePrompter, Wizard};

fn main() {
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            std::process::exit(1);
        }
    };
    match rt.block_on(real_main()) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn real_main() -> Result<i32> {
    let args = cli::Args::parse();

    let cfg_path = match args.config {
        Some(path) => path,
        None => InstallerConfig::default_path()?,
    };
    let mut cfg = InstallerConfig::load_or_create(&cfg_path)
        .with_context(|| format!("Failed to load config from {}", cfg_path.display()))?;
    if args.test_mode {
        info!("Test mode enabled.");
        cfg.port_check.test_mode = true;
    }

    match args.sub.unwrap_or(cli::Cmd::Wizard {
        flavor: cli::Flavor::FullNode,
        openssl: PathBuf::from("openssl"),
    }) {
        cli::Cmd::Wizard { flavor, openssl } => run_wizard(&cfg, flavor.into(), openssl).await,
        cli::Cmd::CheckPort { port, ip } => handle_check_port(&cfg, port, ip).await,
        cli::Cmd::ExternalIp => handle_external_ip(&cfg).await,
        cli::Cmd::Exec {
            executable,
            args,
            input,
            timeout_ms,
        } => handle_exec(&cfg, executable, args, input, timeout_ms).await,
        cli::Cmd::GenCert { out, openssl } => handle_gen_cert(&cfg, openssl, out).await,
        cli::Cmd::Autorun { action } => handle_autorun(&cfg, action).await,
    }
}

fn seed_client(cfg: &InstallerConfig) -> Result<SeedNodeClient> {
    SeedNodeClient::new(&cfg.seed.nodes, cfg.seed.request_timeout())
        .context("Failed to set up seed node client")
}

async fn run_wizard(
    cfg: &InstallerConfig,
    flavor: iop_installer::ports::InstallerFlavor,
    openssl: PathBuf,
) -> Result<i32> {
    let seed = seed_client(cfg)?;
    let checker = PortReachabilityChecker::new(seed.clone(), IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        .with_options(cfg.port_check.checker_options());
    let data_dir = cfg.data_dir()?;
    let layout = ComponentLayout::under(&cfg.components_dir()?);
    let tools = SystemTools::new(cfg.process.success_exit_timeout());

    let wizard = Wizard::new(checker, ConsolePrompter);
    match wizard::run(wizard, flavor, Some(&seed), &data_dir, &layout, &tools).await? {
        Some(result) => {
            info!("Installation plan written to {}", result.plan_path.display());
            for path in &result.config_files {
                info!("Configuration written to {}", path.display());
            }

            let certificate = layout.profile_certificate(openssl);
            certificate.generate(&tools).await.with_context(|| {
                format!(
                    "Failed to generate profile server certificate {}",
                    certificate.pfx_file.display()
                )
            })?;
            println!(
                "Profile server certificate written to {}",
                certificate.pfx_file.display()
            );
            Ok(0)
        }
        None => {
            println!("Installation cancelled.");
            Ok(1)
        }
    }
}

/// Exit 0 = open, 1 = closed or undetermined
async fn handle_check_port(cfg: &InstallerConfig, port: u16, ip: Option<IpAddr>) -> Result<i32> {
    let seed = seed_client(cfg)?;
    let ip = match ip {
        Some(ip) => ip,
        None => seed
            .external_ip()
            .await
            .context("Unable to find out the external IP address, use --ip")?,
    };

    let checker =
        PortReachabilityChecker::new(seed, ip).with_options(cfg.port_check.checker_options());
    if checker.check_port_open(port).await {
        println!("TCP port {port} is open on {ip}");
        Ok(0)
    } else {
        println!("TCP port {port} is not reachable on {ip}");
        Ok(1)
    }
}

async fn handle_external_ip(cfg: &InstallerConfig) -> Result<i32> {
    match seed_client(cfg)?.external_ip().await {
        Some(ip) => {
            println!("{ip}");
            Ok(0)
        }
        None => {
            eprintln!("No seed node reported the external IP address");
            Ok(1)
        }
    }
}

async fn handle_exec(
    cfg: &InstallerConfig,
    executable: String,
    arguments: String,
    input: Vec<String>,
    timeout_ms: Option<u64>,
) -> Result<i32> {
    let timeout = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| cfg.process.exit_timeout());

    let mut process = ManagedProcess::new(executable, arguments);
    if !input.is_empty() {
        process = process.with_input_lines(input);
    }

    if !process.start().await {
        anyhow::bail!("Failed to start '{}'", process.command_line());
    }
    let exited = process.wait_for_exit(timeout).await;

    for line in process.output() {
        println!("{line}");
    }

    if !exited {
        eprintln!("'{}' ended with {:?}", process.command_line(), process.outcome());
        return Ok(1);
    }
    Ok(process.exit_code().unwrap_or(1))
}

async fn handle_gen_cert(cfg: &InstallerConfig, openssl: PathBuf, out: PathBuf) -> Result<i32> {
    let tools = SystemTools::new(cfg.process.success_exit_timeout());
    PfxCertificateRequest::new(openssl, &out)
        .generate(&tools)
        .await
        .with_context(|| format!("Failed to generate certificate {}", out.display()))?;
    println!("Certificate written to {}", out.display());
    Ok(0)
}

async fn handle_autorun(cfg: &InstallerConfig, action: cli::AutorunCmd) -> Result<i32> {
    system::require_root()?;
    let tools = SystemTools::new(cfg.process.success_exit_timeout());

    match action {
        cli::AutorunCmd::Install {
            name,
            bin,
            args,
            user,
            password,
        } => {
            let mut entry = AutorunEntry::new(&name, bin, args, user);
            if let Some(password) = password {
                entry = entry.with_password(password);
            }
            autorun::install(&tools, &entry)
                .await
                .with_context(|| format!("Failed to install autorun entry '{name}'"))?;
            println!("{name} will start at boot");
        }
        cli::AutorunCmd::Remove { name } => {
            autorun::remove(&tools, &name)
                .await
                .with_context(|| format!("Failed to remove autorun entry '{name}'"))?;
            println!("{name} removed");
        }
        cli::AutorunCmd::Start { name } => {
            autorun::start(&tools, &name)
                .await
                .with_context(|| format!("Failed to start '{name}'"))?;
            println!("{name} started");
        }
        cli::AutorunCmd::Stop { name } => {
            autorun::stop(&tools, &name)
                .await
                .with_context(|| format!("Failed to stop '{name}'"))?;
            println!("{name} stopped");
        }
    }
    Ok(0)
}
