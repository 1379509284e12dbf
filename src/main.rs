use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;

use flora_uploads::config::{BlobStoreSelector, Config};
use flora_uploads::http::{AppState, HttpSettings, build_router};
use flora_uploads::ident::IdentifierGenerator;
use flora_uploads::obs;
use flora_uploads::predict::{HttpPredictionClient, PredictionClient};
use flora_uploads::service::{ServiceSettings, UploadService};
use flora_uploads::storage::{
    BlobStore, drive::DriveStore, fs::FsStore, gcs::GcsStore, s3::S3Store,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    obs::init_tracing(cfg.log_format);

    // Storage backend
    let store: Arc<dyn BlobStore> = match cfg.blob_store {
        BlobStoreSelector::Fs => {
            let fs_cfg = cfg
                .fs
                .as_ref()
                .context("missing filesystem configuration for selected backend")?;
            Arc::new(FsStore::new(fs_cfg.root.clone(), fs_cfg.file_mode, fs_cfg.dir_mode).await?)
        }
        BlobStoreSelector::Gcs => {
            let gcs_cfg = cfg
                .gcs
                .as_ref()
                .context("missing GCS configuration for selected backend")?;
            Arc::new(GcsStore::new(gcs_cfg.clone()).await?)
        }
        BlobStoreSelector::S3 => {
            let s3_cfg = cfg
                .s3
                .as_ref()
                .context("missing S3 configuration for selected backend")?;
            Arc::new(S3Store::new(s3_cfg.clone()).await?)
        }
        BlobStoreSelector::Drive => {
            let drive_cfg = cfg
                .drive
                .as_ref()
                .context("missing remote drive configuration for selected backend")?;
            Arc::new(DriveStore::new(drive_cfg.clone())?)
        }
    };

    let ids = IdentifierGenerator::new(cfg.hash_digits)?;
    let service = UploadService::new(
        store,
        ids,
        ServiceSettings {
            max_upload_bytes: cfg.max_upload_bytes,
            backend_timeout: cfg.backend_timeout,
        },
    );

    let predictor = match &cfg.prediction_url {
        Some(url) => {
            let client = HttpPredictionClient::new(url.clone(), cfg.request_timeout)?;
            Some(Arc::new(client) as Arc<dyn PredictionClient>)
        }
        None => None,
    };

    let state = AppState {
        service: Arc::new(service),
        predictor,
    };
    let app = build_router(state, HttpSettings::from_config(&cfg));

    let addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), cfg.port);
    tracing::info!(
        %addr,
        backend = ?cfg.blob_store,
        hash_digits = cfg.hash_digits,
        prediction = cfg.prediction_url.is_some(),
        "listening"
    );
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
