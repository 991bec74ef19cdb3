use crate::*;

use skiff_core::message::{CancelReason, TransferOffer};
use skiff_core::ControlKind;
use skiff_services::{dispatch, Command, CommandResponse, TransferError};

/// Multi-chunk file with a short last chunk arrives byte-identical, and
/// both sides clean up after themselves.
#[tokio::test]
async fn test_file_transfer_end_to_end() -> Result<()> {
    let dir = temp_dir("e2e");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let pair = connect(&mut a, &mut b).await?;

    let source = dir.join("report.bin");
    let data = write_test_file(&source, 5 * 256 * 1024 + 1234);

    let id = pair.a.send_file(&source).await?;
    println!("transfer {id:#010x} started");

    a.wait_for("sender completion", is_completed(id)).await?;
    b.wait_for("receiver completion", is_completed(id)).await?;

    let received = std::fs::read(b.downloads().join("report.bin"))?;
    assert_eq!(received.len(), data.len());
    assert!(received == data, "received file differs from source");

    assert_eq!(a.registry.active_count(), 0);
    assert_eq!(b.registry.active_count(), 0);
    assert!(a.resume.load(id, "phone")?.is_none());
    assert!(b.resume.load(id, "laptop")?.is_none());

    let stats = pair.a_channel.stats();
    assert_eq!(stats.data_frames_out, 6 + stats.retransmissions);
    Ok(())
}

#[tokio::test]
async fn test_empty_file_transfer() -> Result<()> {
    let dir = temp_dir("empty");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let pair = connect(&mut a, &mut b).await?;

    let source = dir.join("empty.txt");
    write_test_file(&source, 0);

    let id = pair.a.send_file(&source).await?;
    b.wait_for("receiver completion", is_completed(id)).await?;
    a.wait_for("sender completion", is_completed(id)).await?;

    let meta = std::fs::metadata(b.downloads().join("empty.txt"))?;
    assert_eq!(meta.len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_transfers_both_directions() -> Result<()> {
    let dir = temp_dir("bidir");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let pair = connect(&mut a, &mut b).await?;

    let from_a = dir.join("from-a.bin");
    let from_b = dir.join("from-b.bin");
    let data_a = write_test_file(&from_a, 700_000);
    let data_b = write_test_file(&from_b, 300_000);

    let (ida, idb) = tokio::try_join!(pair.a.send_file(&from_a), pair.b.send_file(&from_b))?;
    a.wait_all_completed(&[ida, idb]).await?;
    b.wait_all_completed(&[ida, idb]).await?;

    assert!(std::fs::read(b.downloads().join("from-a.bin"))? == data_a);
    assert!(std::fs::read(a.downloads().join("from-b.bin"))? == data_b);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_both_sides() -> Result<()> {
    let dir = temp_dir("cancel");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let pair = connect(&mut a, &mut b).await?;

    let source = dir.join("huge.bin");
    write_test_file(&source, 32 * 1024 * 1024);

    let id = pair.a.send_file(&source).await?;
    pair.a.cancel_transfer(id).await?;

    a.wait_for("local cancel", |e| {
        matches!(e, LifecycleEvent::Cancelled { transfer_id } if *transfer_id == id)
    })
    .await?;
    b.wait_for("remote cancel", |e| {
        matches!(e, LifecycleEvent::Cancelled { transfer_id } if *transfer_id == id)
    })
    .await?;

    assert!(pair.a.status(id).is_none());
    assert!(pair.b.status(id).is_none());
    assert!(a.resume.load(id, "phone")?.is_none());
    assert!(b.resume.load(id, "laptop")?.is_none());
    assert!(matches!(
        pair.a.cancel_transfer(id).await,
        Err(TransferError::UnknownTransfer(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_commands_drive_a_live_session() -> Result<()> {
    let dir = temp_dir("commands");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let pair = connect(&mut a, &mut b).await?;

    let source = dir.join("notes.md");
    write_test_file(&source, 40_000);

    let raw = serde_json::json!({ "command": "send_file", "path": source });
    let command: Command = serde_json::from_value(raw)?;
    let CommandResponse::Started { transfer_id } = dispatch(&pair.a, command).await else {
        bail!("send_file did not start a transfer");
    };

    a.wait_for("completion", is_completed(transfer_id)).await?;
    assert_eq!(
        dispatch(&pair.a, Command::Status { transfer_id }).await,
        CommandResponse::Status(None)
    );
    let listed = dispatch(&pair.a, Command::ListTransfers).await;
    assert_eq!(serde_json::to_value(&listed)?["response"], "transfers");
    Ok(())
}

/// An offer whose chunk count would need a huge bitmap is refused with a
/// Cancel before the receiver allocates anything.
#[tokio::test]
async fn test_offer_with_oversized_geometry_is_refused() -> Result<()> {
    let dir = temp_dir("hostile-offer");
    let a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);

    let (mut sa, sb) = establish_pair(&a, &b).await?;
    let receiver = b.orchestrator();
    let _b_task = spawn_session(&receiver, sb);
    b.wait_for("b connected", is_connected).await?;

    let hostile = TransferOffer {
        file_name: "huge.bin".into(),
        total_size: 1 << 40,
        chunk_size: 1,
        total_chunks: 1 << 40,
        file_hash: None,
        resume: false,
    };
    sa.channel.send_control(hostile.to_frame(77)?).await?;

    let refusal = loop {
        let frame = tokio::time::timeout(EVENT_WAIT, sa.inbound.control.recv())
            .await
            .context("timed out waiting for refusal")?
            .context("control stream closed")?;
        if frame.control_kind() == Some(ControlKind::Cancel) {
            break frame;
        }
    };
    assert_eq!(refusal.transfer_id, 77);
    assert_eq!(CancelReason::from_payload(&refusal.payload), CancelReason::Aborted);
    assert_eq!(b.registry.active_count(), 0);
    assert!(b.resume.load(77, "laptop")?.is_none());
    assert!(!b.downloads().join("huge.bin").exists());
    Ok(())
}
