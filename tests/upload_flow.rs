use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use chrono::{FixedOffset, TimeZone};
use tempfile::TempDir;

use flora_uploads::ident::IdentifierGenerator;
use flora_uploads::service::{
    Clock, NewSubmission, Retrieved, ServiceError, ServiceSettings, UploadService,
};
use flora_uploads::storage::{INDEX_KEY, fs::FsStore};

fn may_first() -> Clock {
    Arc::new(|| {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
            .unwrap()
    })
}

async fn service(root: PathBuf) -> Result<UploadService> {
    let store = FsStore::new(root, None, None).await?;
    Ok(UploadService::with_clock(
        Arc::new(store),
        IdentifierGenerator::new(9)?,
        ServiceSettings::default(),
        may_first(),
    ))
}

fn image(filename: &str, mime: &str, body: &'static [u8], nickname: Option<&str>) -> NewSubmission {
    NewSubmission {
        bytes: Bytes::from_static(body),
        mime_type: Some(mime.to_string()),
        filename: filename.to_string(),
        nickname: nickname.map(str::to_string),
    }
}

#[tokio::test]
async fn local_round_trip_persists_blob_and_index() -> Result<()> {
    let temp = TempDir::new()?;
    let svc = service(temp.path().to_path_buf()).await?;

    let submitted = svc
        .submit(image("My Flower.JPG", "image/jpeg", b"\xff\xd8jpeg", Some("Ada")))
        .await?;
    assert_eq!(submitted.id, "13556845826010524");
    assert_eq!(submitted.public_url, "/uploads/13556845826010524");

    let on_disk = tokio::fs::read(temp.path().join("13556845826010524_My_Flower.JPG")).await?;
    assert_eq!(on_disk, b"\xff\xd8jpeg");

    let index: serde_json::Value =
        serde_json::from_slice(&tokio::fs::read(temp.path().join(INDEX_KEY)).await?)?;
    assert_eq!(index[0]["nickname"], "Ada");
    assert_eq!(index[0]["originalFilename"], "My_Flower.JPG");
    assert_eq!(index[0]["publicPath"], "/uploads/13556845826010524");
    assert_eq!(index[0]["filenameLength"], 13);
    assert_eq!(index[0]["hashedNumeric"], 556845826);

    match svc.retrieve("13556845826010524").await? {
        Retrieved::Blob {
            bytes,
            content_type,
        } => {
            assert_eq!(bytes, Bytes::from_static(b"\xff\xd8jpeg"));
            assert_eq!(content_type, "image/jpeg");
        }
        other => panic!("expected blob, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn index_survives_a_restart() -> Result<()> {
    let temp = TempDir::new()?;
    {
        let svc = service(temp.path().to_path_buf()).await?;
        for name in ["rose.png", "tulip.webp", "daisy.jpeg"] {
            svc.submit(image(name, "image/png", b"x", None)).await?;
        }
    }

    let svc = service(temp.path().to_path_buf()).await?;
    let names: Vec<_> = svc
        .list()
        .await
        .into_iter()
        .map(|r| r.original_filename)
        .collect();
    assert_eq!(names, ["rose.png", "tulip.webp", "daisy.jpeg"]);
    Ok(())
}

#[tokio::test]
async fn concurrent_submissions_all_land_in_the_index() -> Result<()> {
    let temp = TempDir::new()?;
    let svc = Arc::new(service(temp.path().to_path_buf()).await?);

    let mut handles = Vec::new();
    for n in 0..12 {
        let svc = svc.clone();
        handles.push(tokio::spawn(async move {
            svc.submit(NewSubmission {
                bytes: Bytes::from(format!("image {n}")),
                mime_type: Some("image/png".into()),
                filename: format!("flower {n}.png"),
                nickname: None,
            })
            .await
        }));
    }
    for handle in handles {
        handle.await??;
    }

    assert_eq!(svc.list().await.len(), 12);
    Ok(())
}

#[tokio::test]
async fn delete_removes_blob_and_record() -> Result<()> {
    let temp = TempDir::new()?;
    let svc = service(temp.path().to_path_buf()).await?;
    let submitted = svc
        .submit(image("rose.png", "image/png", b"rose", None))
        .await?;
    let stored = temp.path().join(submitted.record.stored_key());
    assert!(stored.exists());

    let summary = svc.delete(&submitted.id).await?;
    assert_eq!(summary.records_removed, 1);
    assert_eq!(summary.blobs_removed, 1);
    assert!(!stored.exists());
    assert!(svc.list().await.is_empty());
    assert!(matches!(
        svc.retrieve(&submitted.id).await,
        Err(ServiceError::NotFound)
    ));
    assert!(matches!(
        svc.delete(&submitted.id).await,
        Err(ServiceError::NotFound)
    ));
    Ok(())
}

#[tokio::test]
async fn delete_by_filename_suffix_leaves_other_submissions_alone() -> Result<()> {
    let temp = TempDir::new()?;
    let svc = service(temp.path().to_path_buf()).await?;
    let submitted = svc
        .submit(image("wild rose.png", "image/png", b"rose", None))
        .await?;
    let stored = temp.path().join(submitted.record.stored_key());
    assert!(stored.exists());

    assert!(matches!(
        svc.delete("rose.png").await,
        Err(ServiceError::NotFound)
    ));
    assert!(stored.exists());
    assert_eq!(svc.list().await.len(), 1);
    assert!(matches!(
        svc.retrieve(&submitted.id).await?,
        Retrieved::Blob { .. }
    ));
    Ok(())
}

#[tokio::test]
async fn rejected_uploads_leave_no_trace() -> Result<()> {
    let temp = TempDir::new()?;
    let svc = service(temp.path().to_path_buf()).await?;

    let err = svc
        .submit(image("notes.txt", "text/plain", b"hello", None))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    assert_eq!(std::fs::read_dir(temp.path())?.count(), 0);
    assert!(svc.list().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn corrupt_index_is_treated_as_empty_and_replaced() -> Result<()> {
    let temp = TempDir::new()?;
    tokio::fs::write(temp.path().join(INDEX_KEY), b"{ definitely not json").await?;
    let svc = service(temp.path().to_path_buf()).await?;

    assert!(svc.list().await.is_empty());
    svc.submit(image("rose.png", "image/png", b"x", None)).await?;
    assert_eq!(svc.list().await.len(), 1);
    Ok(())
}
