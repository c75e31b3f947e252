use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "teamwire-server", about = "Teamwire realtime collaboration server")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/teamwire.toml")]
    pub config: String,

    /// Listen address (overrides config)
    #[arg(long)]
    pub bind: Option<String>,

    /// Print a session token for the given user id and exit
    #[arg(long, value_name = "USER_ID")]
    pub print_token: Option<i64>,
}
