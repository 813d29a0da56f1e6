// src/main.rs - stage-host: run motion commands against a simulated rig
use std::f64::consts::FRAC_PI_2;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stage_sync::{ArcGeometry, Config, MotionReport, MotionSystem, load_config};

/// Stage host CLI
#[derive(Parser, Debug)]
#[command(name = "stage-host", about = "Synchronized stage motion on a simulated rig.")]
struct Cli {
    /// Path to a TOML rig description (defaults to a two-axis rig)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Independent point-to-point move, e.g. `jump xy 10 5`
    Jump {
        devices: String,
        positions: Vec<f64>,
        #[arg(long)]
        speed: Option<f64>,
    },
    /// Synchronized straight line
    Line {
        devices: String,
        positions: Vec<f64>,
        #[arg(long)]
        speed: Option<f64>,
        /// Add lead-in and lead-out ramps
        #[arg(long)]
        leads: bool,
        /// Open the shutter during the constant-speed part
        #[arg(long)]
        shutter: bool,
    },
    /// Arc around a center; angles in radians
    Arc {
        devices: String,
        #[arg(long)]
        radius: f64,
        #[arg(long, default_value_t = 0.0)]
        cx: f64,
        #[arg(long, default_value_t = 0.0)]
        cy: f64,
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        #[arg(long)]
        end: f64,
        /// Clockwise instead of counter-clockwise
        #[arg(long)]
        cw: bool,
        #[arg(long)]
        speed: Option<f64>,
        #[arg(long)]
        accuracy: Option<f64>,
    },
    /// Short program: jump, blended lines and a quarter arc with the shutter
    Demo,
    /// Validate the configuration and print it
    CheckConfig,
}

fn print_report(label: &str, report: &MotionReport) {
    match serde_json::to_string(report) {
        Ok(json) => println!("{}: {}", label, json),
        Err(e) => tracing::warn!("Cannot serialize report: {}", e),
    }
}

async fn run_demo(system: &MotionSystem) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let props = system.move_properties();
    print_report("jump", &system.jump("xy", &[0.0, 0.0], &props).await?);
    let blended = props.clone().with_blending(true);
    print_report("line", &system.line("xy", &[20.0, 10.0], &blended).await?);
    print_report("line", &system.line("xy", &[40.0, 0.0], &blended).await?);
    print_report("line", &system.line("xy", &[50.0, 0.0], &props).await?);
    let arc = ArcGeometry {
        radius: 50.0,
        center: (0.0, 0.0),
        start_angle: 0.0,
        end_angle: FRAC_PI_2,
        ccw: true,
    };
    let arc_props = props.with_speed(100.0).with_shutter(true).with_leads(true, true);
    print_report("arc", &system.arc("xy", arc, &arc_props).await?);
    for entry in system.diagnostics().entries() {
        println!("{}", entry);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    let config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            load_config(&path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path, e);
                Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
            })?
        }
        None => Config::default(),
    };

    if let Commands::CheckConfig = cli.command {
        config.validate()?;
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let system = MotionSystem::new(config).await?;
    let props = system.move_properties();
    let outcome: Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> = match cli.command {
        Commands::Jump { devices, positions, speed } => {
            let props = match speed {
                Some(speed) => props.with_speed(speed),
                None => props,
            };
            system
                .jump(&devices, &positions, &props)
                .await
                .map(|r| print_report("jump", &r))
                .map_err(Into::into)
        }
        Commands::Line {
            devices,
            positions,
            speed,
            leads,
            shutter,
        } => {
            let mut props = props.with_leads(leads, leads).with_shutter(shutter);
            props.speed = speed.or(props.speed);
            system
                .line(&devices, &positions, &props)
                .await
                .map(|r| print_report("line", &r))
                .map_err(Into::into)
        }
        Commands::Arc {
            devices,
            radius,
            cx,
            cy,
            start,
            end,
            cw,
            speed,
            accuracy,
        } => {
            let mut props = props;
            props.speed = speed.or(props.speed);
            props.accuracy = accuracy.unwrap_or(props.accuracy);
            let geometry = ArcGeometry {
                radius,
                center: (cx, cy),
                start_angle: start,
                end_angle: end,
                ccw: !cw,
            };
            system
                .arc(&devices, geometry, &props)
                .await
                .map(|r| print_report("arc", &r))
                .map_err(Into::into)
        }
        Commands::Demo => run_demo(&system).await,
        Commands::CheckConfig => Ok(()),
    };

    for name in system.arena().names() {
        if let Ok(position) = system.position(name) {
            tracing::info!("{} = {:.4}", name, position);
        }
    }
    system.shutdown().await;
    outcome
}
