//! Enqueue a full library sync for a user. Useful for kicking the pipeline
//! from the command line while the daemon's workers are running.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use tunesync::{config, db, sync};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Catalog user id to sync
    #[arg(long)]
    user: String,

    /// Display name stored on first sight of this user
    #[arg(long)]
    display_name: Option<String>,

    /// Seed an access token for the user
    #[arg(long)]
    access_token: Option<String>,

    /// Seed a refresh token for the user
    #[arg(long)]
    refresh_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| format!("sqlite://{}/tunesync.db", cfg.app.data_dir));

    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let user_id = db::get_or_create_user(&pool, &args.user, args.display_name.as_deref()).await?;
    if let (Some(access), Some(refresh)) = (&args.access_token, &args.refresh_token) {
        db::set_user_tokens(&pool, user_id, access, refresh).await?;
    }

    let task_id = sync::enqueue_library_sync(&pool, user_id).await?;
    println!("enqueued library sync task {task_id} for user {user_id}");
    Ok(())
}
