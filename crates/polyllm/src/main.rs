// polyllm/crates/polyllm/src/main.rs

#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};
#[cfg(feature = "cli")]
use dotenvy::dotenv;
#[cfg(feature = "cli")]
use polyllm::{
    config::debug_from_env, telemetry::init_tracing, BackendKind, HubClient, LlamaServer, LoadOptions, LocalModelStore,
    ModelBackend, ModelEnvDefaults, ModelHandle, RuntimeSettings, TagResolver,
};
#[cfg(feature = "cli")]
use std::sync::Arc;

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "polyllm", version, about = "Resolve and import model artifacts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Print the artifact tag a model id resolves to
    Tag {
        model_id: String,
        #[arg(long)]
        version: Option<String>,
        /// Defaults to `POLYLLM_<MODEL_NAME>_FRAMEWORK`, then `pt`
        #[arg(long)]
        backend: Option<BackendKind>,
        /// Start name whose `POLYLLM_<MODEL_NAME>_*` defaults apply
        #[arg(long, default_value = "llama")]
        model_name: String,
    },
    /// Import a llama.cpp model into the local store
    Download {
        model_id: String,
        #[arg(long)]
        version: Option<String>,
    },
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    init_tracing(debug_from_env());

    let settings = Arc::new(RuntimeSettings::from_env()?);
    settings.print_config();

    match Cli::parse().command {
        Command::Tag {
            model_id,
            version,
            backend,
            model_name,
        } => {
            let env = ModelEnvDefaults::from_env(&model_name)?;
            let backend = backend.unwrap_or_else(|| env.framework_or(BackendKind::Pt));
            let repository = Arc::new(HubClient::from_settings(&settings)?);
            let store = Arc::new(LocalModelStore::new(settings.store_root.clone()));
            let resolver = TagResolver::new(settings.clone(), repository, store);
            let tag = resolver.resolve(&model_id, version.as_deref(), backend).await?;
            println!("{}", tag);
        }
        Command::Download { model_id, version } => {
            let mut options = LoadOptions::default().model_id(model_id);
            if let Some(version) = version {
                options = options.model_version(version);
            }
            let backend = LlamaServer::default();
            let env = ModelEnvDefaults::from_env(&backend.model_config().start_name)?;
            let mut handle = ModelHandle::from_pretrained(backend, settings.clone())
                .options(options)
                .env_defaults(env)
                .build()
                .await?;
            let artifact = handle.ensure_model_id_exists().await?;
            println!("📦 {} -> {}", artifact.tag, artifact.path.display());
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
