use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use lms_server::{
    AppState, api,
    config::{Config, Secrets},
    db, mail, user,
    utils::init_log,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(disable_help_flag = true)]
struct Args {
    #[arg(short, long, default_value = "database/lms.db")]
    database: PathBuf,
    /// TOML file with [otp], [auth] and [mail] sections
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,
    #[arg(short, long, default_value = "8080")]
    port: u16,
    /// Directory for daily rotated log files, stdout when absent
    #[arg(short, long)]
    log: Option<PathBuf>,
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _guard = init_log(args.log)?;

    let config = Config::load(args.config.as_deref())?;
    let secrets = Secrets::from_env()?;

    if let Some(parent) = args.database.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let database = db::connect(&args.database).await?;
    if let Some((email, password)) = &secrets.admin {
        user::ensure_admin(&database, email, password).await?;
        info!("admin account {email} is present");
    }

    let mailer: Arc<dyn mail::Mailer> =
        Arc::from(mail::from_config(&config.mail, secrets.smtp_password.clone())?);
    let state = AppState::new(database, config, secrets.jwt_secret.as_bytes(), mailer);

    let listener = tokio::net::TcpListener::bind((args.host.as_str(), args.port)).await?;
    info!("listening on http://{}", listener.local_addr()?);
    info!("swagger ui at http://{}/swagger-ui/", listener.local_addr()?);
    axum::serve(listener, api::router(state)).await?;
    Ok(())
}
