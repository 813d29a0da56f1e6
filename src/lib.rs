// src/lib.rs - Synchronized multi-axis stage motion engine
pub mod command;
pub mod config;
pub mod controller;
pub mod device;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod planner;
pub mod system;

pub use command::{Command, CommandAction, CommandLine, CommandParameters, Completion, MoveTarget, ShutterTiming};
pub use config::{Config, ConfigError, load_config};
pub use device::{DeviceArena, DeviceId, DeviceName};
pub use diagnostics::{DiagnosticLog, LogLevel};
pub use dispatch::CommandDispatcher;
pub use error::{MotionError, MotionResult};
pub use planner::{MoveProperties, TrajectoryPlanner};
pub use system::{ArcGeometry, MotionReport, MotionSystem, SystemError};
