use clap::Parser;

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Parser)]
#[command(name = "infergate", version, about = "Inference serving gateway")]
pub struct Cli {
    /// Path to the server interface/resource declaration document.
    #[arg(long, env = "INFERGATE_SERVER_CONFIG", default_value = "server.yml")]
    pub server_config: std::path::PathBuf,

    /// Path to the model/pipeline declaration document.
    #[arg(long, env = "INFERGATE_INFERENCE_CONFIG", default_value = "inference.yml")]
    pub inference_config: std::path::PathBuf,

    /// Default log level, only used to seed `RUST_LOG` when it is unset.
    #[arg(long, env = "INFERGATE_LOG_LEVEL", default_value_t = default_log_level())]
    pub log_level: String,

    /// Bring the health state up immediately at boot instead of waiting for
    /// `POST /grps/v1/health/online`.
    #[arg(long, env = "INFERGATE_ONLINE", default_value_t = false)]
    pub online: bool,
}
