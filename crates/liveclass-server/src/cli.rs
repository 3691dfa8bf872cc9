use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "liveclass-server", about = "Live class coordination server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/liveclass.toml")]
    pub config: String,
}
