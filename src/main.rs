//! Astra SoC USB boot/flash CLI.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, Level};

mod cli;
use cli::{Cli, Commands};

use astra_update::flash_image::FlashImage;
use astra_update::manager::{Manager, ManagerConfig, UenvResetStyle};
use astra_update::response::{ManagerStatus, Response};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Flash {
            flash_image,
            firmware_root,
            continuous,
            log,
            temp_dir,
            usb_debug,
            config,
        } => {
            let config_map = cli::config_map(config);
            let flash_image = FlashImage::from(flash_image, &config_map, None)
                .with_context(|| format!("loading flash image at {flash_image:?}"))?;

            ManagerConfig {
                flash_image: Some(flash_image),
                boot_firmware_root: firmware_root.clone(),
                boot_firmware_id: None,
                boot_command: None,
                continuous: *continuous,
                min_log_level: Level::INFO,
                log_path: log.clone(),
                temp_dir: temp_dir.clone(),
                usb_debug: *usb_debug,
                uenv_reset_style: UenvResetStyle::default(),
            }
        }
        Commands::Boot {
            firmware_id,
            firmware_root,
            boot_command,
            log,
            temp_dir,
        } => ManagerConfig {
            flash_image: None,
            boot_firmware_root: firmware_root.clone(),
            boot_firmware_id: Some(firmware_id.clone()),
            boot_command: boot_command.clone(),
            continuous: false,
            min_log_level: Level::INFO,
            log_path: log.clone(),
            temp_dir: temp_dir.clone(),
            usb_debug: false,
            uenv_reset_style: UenvResetStyle::default(),
        },
    };

    let shutdown_requested = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown_requested);
    let response_callback: Arc<dyn Fn(Response) + Send + Sync> = Arc::new(move |response| match response {
        Response::Manager(r) => {
            info!("[manager] {:?}: {}", r.status, r.message);
            if r.status == ManagerStatus::Shutdown {
                shutdown_flag.store(true, Ordering::SeqCst);
            }
        }
        Response::Device(r) => info!(
            "[{}] {:?} progress={:.1} image={} {}",
            r.device, r.status, r.progress, r.image, r.message
        ),
    });

    let manager = Arc::new(Manager::new(config, response_callback).context("constructing manager")?);
    manager.init().context("starting manager")?;

    install_ctrlc_handler(&shutdown_requested);

    while !shutdown_requested.load(Ordering::SeqCst) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    info!("shutting down");
    let failed = manager.shutdown();
    if failed {
        anyhow::bail!("one or more devices reported a failure");
    }
    Ok(())
}

fn install_ctrlc_handler(shutdown_requested: &Arc<AtomicBool>) {
    let flag = Arc::clone(shutdown_requested);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .expect("failed to install Ctrl-C handler");
}
