//! The process-wide shared state handlers are given (§9 Design notes:
//! "Global module state ... becomes explicit: a `Runtime` value owns MKM,
//! session DB, kernel-spec manager, and is passed to handlers").

use std::net::IpAddr;
use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;

use crate::config::Settings;
use crate::error::Result;
use crate::mkm::MultiKernelManager;
use crate::session::SessionRegistry;

#[derive(Clone)]
pub struct Runtime {
    pub settings: Arc<Settings>,
    pub mkm: Arc<MultiKernelManager>,
    pub sessions: Arc<SessionRegistry>,
}

impl Runtime {
    pub async fn build(settings: Settings) -> Result<Runtime> {
        let settings = Arc::new(settings);
        let ip: IpAddr = settings
            .ip
            .parse()
            .map_err(|_| crate::error::AppError::Internal(format!("bad ZASPER_IP `{}`", settings.ip)))?;
        let runtime_dir = zasper_runtime::dirs::runtime_dir()?;

        let mkm = Arc::new(MultiKernelManager::new(settings.clone(), ip, runtime_dir));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&settings.db_url)
            .await?;
        let sessions = Arc::new(SessionRegistry::new(pool, mkm.clone()).await?);

        Ok(Runtime { settings, mkm, sessions })
    }
}
