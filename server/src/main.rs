use clap::Parser;
use clonner_model::{
    accounts::Accounts,
    cache::{self, CacheManager},
    init_logging_to,
    instagram::{Client, Instagram, LocalClient},
    session,
};
use std::path::PathBuf;

mod api;
mod test_runner;

/// Serve the Instagram cloner.
#[derive(Clone, Debug, Parser)]
struct Options {
    /// The port where the app should be served.
    #[clap(short, long, env = "CLONNER_PORT", default_value = "3000")]
    port: u16,

    /// The address to bind to.
    #[clap(long, env = "CLONNER_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Serve accounts from a local directory instead of Instagram.
    ///
    /// This should be a directory with the structure
    ///
    ///     DIR/
    ///         <login>/
    ///             account.json
    ///             password
    ///             following.json
    ///             collections/
    #[clap(long, env = "CLONNER_LOCAL_DATA", value_name = "DIR")]
    local: Option<PathBuf>,

    /// Also write logs to a new file in DIR.
    #[clap(long, env = "CLONNER_LOG_DIR", value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[clap(flatten)]
    sessions: session::Options,

    #[clap(flatten)]
    cache: cache::Options,
}

impl Options {
    async fn serve(&self) -> tide::Result<()> {
        match &self.local {
            Some(dir) => {
                tracing::info!("serving local accounts from {}", dir.display());
                self.serve_with(LocalClient::open(dir.clone())).await
            }
            None => self.serve_with(Client::new()?).await,
        }
    }

    async fn serve_with<I: Instagram>(&self, backend: I) -> tide::Result<()> {
        let accounts = Accounts::new(backend, self.sessions.store());
        let cache = if self.cache.cache_images {
            Some(CacheManager::new(self.cache.cache_dir.clone())?)
        } else {
            None
        };
        let app = api::app(api::State::new(accounts, cache))?;

        let addr = format!("{}:{}", self.host, self.port);
        tracing::info!("listening on {addr}");
        app.listen(addr).await?;
        Ok(())
    }
}

#[async_std::main]
async fn main() -> tide::Result<()> {
    let opt = Options::parse();
    init_logging_to(opt.log_dir.as_deref())?;
    opt.serve().await
}
