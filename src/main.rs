use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use melodia::generation::SunoClient;
use melodia::lyricist::GeminiLyricsWriter;
use melodia::mailer::ResendMailer;
use melodia::payments::{PaymentStore, RazorpayClient};
use melodia::requests::RequestStore;
use melodia::server::{self, AppState};
use melodia::songs::SongStore;
use melodia::users::UserStore;

#[derive(Parser)]
#[command(name = "melodia")]
#[command(about = "Melodia Server", long_about = None)]
struct Cli {
    /// Path to the SQLite database file
    #[arg(short, long, env = "MELODIA_DATABASE", default_value = "data/melodia.db")]
    database: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Secret used to sign session tokens
    #[arg(long, env = "MELODIA_AUTH_SECRET")]
    auth_secret: String,

    /// API key for the music generation provider
    #[arg(long, env = "SUNO_API_KEY")]
    suno_api_key: String,

    /// Public URL the generation provider posts callbacks to
    #[arg(long, env = "GENERATION_CALLBACK_URL")]
    callback_url: Option<String>,

    /// API key for the lyrics LLM provider
    #[arg(long, env = "GEMINI_API_KEY")]
    gemini_api_key: String,

    /// API key for the transactional mail provider
    #[arg(long, env = "RESEND_API_KEY")]
    resend_api_key: String,

    /// From address for outgoing mail
    #[arg(long, env = "MAIL_FROM", default_value = "Melodia <no-reply@melodia.app>")]
    mail_from: String,

    /// Payment provider key id
    #[arg(long, env = "RAZORPAY_KEY_ID")]
    razorpay_key_id: String,

    /// Payment provider key secret
    #[arg(long, env = "RAZORPAY_KEY_SECRET")]
    razorpay_key_secret: String,

    /// Payment provider webhook secret
    #[arg(long, env = "RAZORPAY_WEBHOOK_SECRET")]
    razorpay_webhook_secret: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "melodia=debug,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();

    tracing::info!("Starting Melodia");
    tracing::info!("Database: {}", cli.database.display());

    let pool = melodia::db::open_pool(&cli.database).await?;

    let users = UserStore::new(pool.clone())
        .await
        .context("Failed to initialize user store")?;
    let requests = RequestStore::new(pool.clone())
        .await
        .context("Failed to initialize request store")?;
    let songs = SongStore::new(pool.clone())
        .await
        .context("Failed to initialize song store")?;
    let payment_store = PaymentStore::new(pool.clone())
        .await
        .context("Failed to initialize payment store")?;

    let generator = SunoClient::new(cli.suno_api_key, cli.callback_url)
        .context("Failed to initialize generation client")?;
    let lyricist = GeminiLyricsWriter::new(cli.gemini_api_key)
        .context("Failed to initialize lyrics client")?;
    let mailer = ResendMailer::new(cli.resend_api_key, cli.mail_from)
        .context("Failed to initialize mail client")?;
    let payments = RazorpayClient::new(
        cli.razorpay_key_id,
        cli.razorpay_key_secret,
        cli.razorpay_webhook_secret,
    )
    .context("Failed to initialize payment client")?;

    let state = AppState {
        users,
        requests,
        songs,
        payment_store,
        generator: Arc::new(generator),
        lyricist: Arc::new(lyricist),
        mailer: Arc::new(mailer),
        payments: Arc::new(payments),
        auth_secret: cli.auth_secret,
    };

    let app = server::create_router(state);
    let addr = format!("0.0.0.0:{}", cli.port);

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("API endpoints:");
    tracing::info!("  POST /auth/otp/request       - Email a sign-in code");
    tracing::info!("  POST /auth/otp/verify        - Verify code, mint token");
    tracing::info!("  POST /requests               - Create a song request");
    tracing::info!("  POST /requests/:id/lyrics    - Generate a lyrics draft");
    tracing::info!("  POST /requests/:id/generate  - Start music generation");
    tracing::info!("  POST /api/song/status/:id    - Poll generation status");
    tracing::info!("  GET  /songs/:id/play         - Playback with timed lyrics");
    tracing::info!("  POST /webhooks/generation    - Generation provider webhook");
    tracing::info!("  POST /webhooks/payment       - Payment provider webhook");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
