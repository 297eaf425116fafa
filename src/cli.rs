use clap::{ArgAction, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about, rename_all = "kebab-case")]
pub struct Opts {
    #[command(flatten)]
    pub root: RootOpts,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Parser)]
pub struct RootOpts {
    /// Enable more detailed internal logging. Repeat to increase level.
    /// Overridden by `--quiet`.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Reduce detail of internal logging. Repeat to reduce further.
    /// Overrides `--verbose`.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub quiet: u8,

    /// Number of threads to use for processing (default is the number of
    /// available cores).
    #[arg(short, long, global = true)]
    pub threads: Option<usize>,
}

impl RootOpts {
    pub const fn log_level(&self) -> &'static str {
        match self.quiet {
            0 => match self.verbose {
                0 => "info",
                1 => "debug",
                2..=255 => "trace",
            },
            1 => "warn",
            2 => "error",
            3..=255 => "off",
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane: queue observer, AIMD controller and event
    /// router.
    Controller,
    /// Run a per-worker admission gate.
    Gate,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn verify_cli() {
        Opts::command().debug_assert();
    }

    #[test]
    fn log_level_resolution() {
        let parse = |args: &[&str]| Opts::try_parse_from(args).unwrap();

        assert_eq!(parse(&["floodgate", "controller"]).root.log_level(), "info");
        assert_eq!(
            parse(&["floodgate", "controller", "-v"]).root.log_level(),
            "debug"
        );
        assert_eq!(
            parse(&["floodgate", "-vv", "gate"]).root.log_level(),
            "trace"
        );
        assert_eq!(parse(&["floodgate", "gate", "-q"]).root.log_level(), "warn");
        assert_eq!(
            parse(&["floodgate", "gate", "-qqq"]).root.log_level(),
            "off"
        );
    }
}
