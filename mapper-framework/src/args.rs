//! CLI argument parsing for mappers.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for all mappers.
#[derive(Parser, Debug, Clone)]
#[command(about = "Edge device mapper")]
pub struct MapperArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl MapperArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If no `--config` argument is provided, uses the default.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        Self::parse_from_with_default(std::env::args_os(), default_config)
    }

    /// Parse an explicit argument list with a default config path.
    pub fn parse_from_with_default<I, T>(args: I, default_config: &'static str) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches_from(args);

        <Self as clap::FromArgMatches>::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_path() {
        let args = MapperArgs::parse_from_with_default(["modbus-mapper"], "modbus-mapper.json5");
        assert_eq!(args.config, PathBuf::from("modbus-mapper.json5"));
        assert!(args.log_level.is_none());
    }

    #[test]
    fn test_overrides() {
        let args = MapperArgs::parse_from_with_default(
            ["modbus-mapper", "-c", "/etc/mapper.json5", "--log-level", "debug"],
            "modbus-mapper.json5",
        );
        assert_eq!(args.config, PathBuf::from("/etc/mapper.json5"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
    }
}
