use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "session-statusline",
    version,
    about = "Render a one-line session status from the JSON request on stdin"
)]
pub struct Cli {
    /// Emit plain text without ANSI colors (NO_COLOR is honored as well).
    #[arg(long, global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print tracker paths and today's accumulated working time.
    Status,
    /// Check that session records can be written and git is reachable.
    Doctor,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_renders_statusline() {
        let cli = Cli::try_parse_from(["session-statusline"]).expect("parse");
        assert!(cli.command.is_none());
        assert!(!cli.no_color);
    }

    #[test]
    fn no_color_applies_to_subcommands() {
        let cli = Cli::try_parse_from(["session-statusline", "status", "--no-color"]).expect("parse");
        assert!(matches!(cli.command, Some(Commands::Status)));
        assert!(cli.no_color);
    }
}
