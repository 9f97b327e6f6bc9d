// src/cli.rs

use crate::types::HoldPolicy;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "drone-patrol",
    version,
    about = "Fly a waypoint plan and engage targets seen on the way"
)]
pub struct Cli {
    #[arg(long, global = true, default_value = "mission.yaml", help = "YAML config file")]
    pub config: PathBuf,
    #[arg(
        long,
        global = true,
        default_value = "plans",
        help = "Directory searched for plans and relative plan paths"
    )]
    pub plans_dir: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect, take off and fly the plan
    Fly(FlyArgs),
    /// Print what a flight would do without touching the vehicle
    DryRun(PlanArgs),
}

#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Plan JSON; defaults to the newest plan in the plans directory
    pub plan: Option<PathBuf>,
    #[arg(long, default_value_t = false, help = "Ignore PLAN and use the newest plan")]
    pub use_last: bool,
}

#[derive(Args, Debug, Clone)]
pub struct FlyArgs {
    #[command(flatten)]
    pub plan: PlanArgs,
    #[arg(
        long,
        num_args = 0..=1,
        default_missing_value = "",
        help = "Also write log files; without a value they are timestamped under logging.dir"
    )]
    pub log: Option<String>,
    #[arg(long, default_value_t = false, help = "Fly the simulated vehicle")]
    pub sim: bool,
    #[arg(long, help = "Replay a YAML detection script instead of the camera model")]
    pub detections: Option<PathBuf>,
    #[arg(long, default_value_t = false, help = "Fly the plan without detection")]
    pub no_detect: bool,
    #[arg(long, value_enum, help = "Override the engagement hold policy")]
    pub hold: Option<HoldArg>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldArg {
    UntilLost,
    Timed,
}

impl From<HoldArg> for HoldPolicy {
    fn from(arg: HoldArg) -> Self {
        match arg {
            HoldArg::UntilLost => HoldPolicy::UntilLost,
            HoldArg::Timed => HoldPolicy::Timed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fly_defaults() {
        let cli = Cli::try_parse_from(["drone-patrol", "fly"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("mission.yaml"));
        assert_eq!(cli.plans_dir, PathBuf::from("plans"));
        let Commands::Fly(args) = cli.command else {
            panic!("expected fly");
        };
        assert!(args.plan.plan.is_none());
        assert!(!args.plan.use_last);
        assert!(args.log.is_none());
        assert!(!args.sim && !args.no_detect);
        assert!(args.hold.is_none());
    }

    #[test]
    fn test_fly_flags() {
        let cli = Cli::try_parse_from([
            "drone-patrol",
            "fly",
            "route.json",
            "--sim",
            "--log",
            "--detections",
            "script.yaml",
            "--hold",
            "timed",
            "--config",
            "other.yaml",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("other.yaml"));
        let Commands::Fly(args) = cli.command else {
            panic!("expected fly");
        };
        assert_eq!(args.plan.plan, Some(PathBuf::from("route.json")));
        assert_eq!(args.log.as_deref(), Some(""));
        assert_eq!(args.detections, Some(PathBuf::from("script.yaml")));
        assert_eq!(args.hold.map(HoldPolicy::from), Some(HoldPolicy::Timed));
        assert!(args.sim);
    }

    #[test]
    fn test_log_with_path() {
        let cli = Cli::try_parse_from(["drone-patrol", "fly", "--log", "out/flight.log"]).unwrap();
        let Commands::Fly(args) = cli.command else {
            panic!("expected fly");
        };
        assert_eq!(args.log.as_deref(), Some("out/flight.log"));
    }

    #[test]
    fn test_dry_run() {
        let cli =
            Cli::try_parse_from(["drone-patrol", "dry-run", "--use-last", "--plans-dir", "p"]).unwrap();
        assert_eq!(cli.plans_dir, PathBuf::from("p"));
        let Commands::DryRun(args) = cli.command else {
            panic!("expected dry-run");
        };
        assert!(args.use_last);
        assert!(Cli::try_parse_from(["drone-patrol", "dry-run", "--sim"]).is_err());
    }
}
