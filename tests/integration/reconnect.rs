use crate::*;

use skiff_services::{ProgressEvent, ReconnectPolicy, SessionSupervisor};

fn fast_policy(attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy::new(Duration::from_millis(10), attempts)
}

/// Wait until the receiver has written something for `id`.
async fn wait_progress(progress: &mut mpsc::Receiver<ProgressEvent>, id: u32) -> Result<()> {
    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    loop {
        let event = tokio::time::timeout_at(deadline, progress.recv())
            .await
            .context("timed out waiting for progress")?
            .context("progress stream closed")?;
        if event.transfer_id == id && event.bytes_transferred > 0 {
            return Ok(());
        }
    }
}

/// The connection drops mid-transfer; the supervisor re-dials, re-handshakes
/// and the transfer finishes from where it stopped.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_supervisor_resumes_after_connection_drop() -> Result<()> {
    let dir = temp_dir("reconnect");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let connector = LoopbackConnector::new(&b);

    let sender = a.orchestrator();
    let supervisor = SessionSupervisor::new(
        connector.clone(),
        a.session.clone(),
        fast_policy(5),
        sender.clone(),
    );
    let supervision = supervisor.start().await?;
    a.wait_for("connected", is_connected).await?;

    let source = dir.join("backup.tar");
    let data = write_test_file(&source, 32 * 1024 * 1024);
    let id = sender.send_file(&source).await?;

    wait_progress(&mut b.streams.progress, id).await?;
    connector.cut().await;

    a.wait_for("pause", |e| {
        matches!(e, LifecycleEvent::Paused { transfer_id } if *transfer_id == id)
    })
    .await?;
    a.wait_for("transient loss", |e| {
        matches!(e, LifecycleEvent::ConnectionLost { permanent: false, .. })
    })
    .await?;
    a.wait_for("reconnected", is_connected).await?;
    a.wait_for("resumed", |e| {
        matches!(e, LifecycleEvent::Resumed { transfer_id, .. } if *transfer_id == id)
    })
    .await?;
    a.wait_for("sender completion", is_completed(id)).await?;
    b.wait_for("receiver completion", is_completed(id)).await?;

    assert_eq!(connector.dials(), 2);
    let received = std::fs::read(b.downloads().join("backup.tar"))?;
    assert!(received == data, "file differs after reconnect");

    sender.detach().await;
    supervision.await??;
    Ok(())
}

#[tokio::test]
async fn test_supervisor_gives_up_after_max_attempts() -> Result<()> {
    let dir = temp_dir("reconnect-exhausted");
    let mut a = Node::new("laptop", &dir);
    let b = Node::new("phone", &dir);
    let connector = LoopbackConnector::new(&b);

    let sender = a.orchestrator();
    let supervision = SessionSupervisor::new(
        connector.clone(),
        a.session.clone(),
        fast_policy(3),
        sender.clone(),
    )
    .start()
    .await?;
    a.wait_for("connected", is_connected).await?;

    connector.refuse();
    connector.cut().await;

    let lost = a
        .wait_for("permanent loss", |e| {
            matches!(e, LifecycleEvent::ConnectionLost { permanent: true, .. })
        })
        .await?;
    println!("gave up: {lost:?}");
    assert!(supervision.await?.is_err());
    assert_eq!(connector.dials(), 1 + 3);
    assert!(!sender.is_attached().await);
    Ok(())
}

/// The sender's end of the link dies while the receiver's end stays open, so
/// the receiver still holds the download when the resume offer arrives over
/// the new connection. The new connection takes the download over.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_resume_replaces_transfer_held_by_half_open_connection() -> Result<()> {
    let dir = temp_dir("reconnect-half-open");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let connector = LoopbackConnector::new(&b);

    let sender = a.orchestrator();
    let supervision = SessionSupervisor::new(
        connector.clone(),
        a.session.clone(),
        fast_policy(5),
        sender.clone(),
    )
    .start()
    .await?;
    a.wait_for("connected", is_connected).await?;

    let source = dir.join("photos.tar");
    let data = write_test_file(&source, 32 * 1024 * 1024);
    let id = sender.send_file(&source).await?;

    wait_progress(&mut b.streams.progress, id).await?;
    connector.stall();

    a.wait_for("pause", |e| {
        matches!(e, LifecycleEvent::Paused { transfer_id } if *transfer_id == id)
    })
    .await?;
    a.wait_for("reconnected", is_connected).await?;
    a.wait_for("resumed", |e| {
        matches!(e, LifecycleEvent::Resumed { transfer_id, .. } if *transfer_id == id)
    })
    .await?;
    a.wait_for("sender completion", is_completed(id)).await?;
    b.wait_for("receiver completion", is_completed(id)).await?;

    assert_eq!(connector.dials(), 2);
    assert_eq!(connector.stalled(), 1);
    assert_eq!(b.registry.active_count(), 0);
    let received = std::fs::read(b.downloads().join("photos.tar"))?;
    assert!(received == data, "file differs after taking over the transfer");
    assert!(a.resume.load(id, "phone")?.is_none());
    assert!(b.resume.load(id, "laptop")?.is_none());

    sender.detach().await;
    supervision.await??;
    Ok(())
}
