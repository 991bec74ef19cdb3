use crate::*;

use skiff_services::{TransferError, TransferStatus};

/// Five transfers held open by a receiver that is not reading yet; the sixth
/// is refused at once and the five finish normally afterwards.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sixth_transfer_is_rejected() -> Result<()> {
    let dir = temp_dir("capacity");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);

    let (sa, sb) = establish_pair(&a, &b).await?;
    let sender = a.orchestrator();
    let _a_task = spawn_session(&sender, sa);
    a.wait_for("a connected", is_connected).await?;

    let mut files = Vec::new();
    let mut ids = Vec::new();
    for n in 0..5 {
        let path = dir.join(format!("part-{n}.bin"));
        files.push(write_test_file(&path, 2 * 256 * 1024 + n * 100));
        ids.push(sender.send_file(&path).await?);
    }

    let sixth = dir.join("part-5.bin");
    write_test_file(&sixth, 1000);
    match sender.send_file(&sixth).await {
        Err(TransferError::Capacity { active, limit }) => assert_eq!((active, limit), (5, 5)),
        other => bail!("expected a capacity error, got {other:?}"),
    }

    let listed = sender.list();
    assert_eq!(listed.len(), 5);
    assert!(listed.iter().all(|t| t.status == TransferStatus::InProgress));

    // Let the receiver start working through what is queued.
    let receiver = b.orchestrator();
    let _b_task = spawn_session(&receiver, sb);
    a.wait_all_completed(&ids).await?;
    b.wait_all_completed(&ids).await?;

    for (n, expected) in files.iter().enumerate() {
        let got = std::fs::read(b.downloads().join(format!("part-{n}.bin")))?;
        assert!(&got == expected, "part-{n} differs");
    }
    assert_eq!(a.registry.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_receiver_at_capacity_refuses_offer() -> Result<()> {
    let dir = temp_dir("capacity-recv");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::with_capacity("phone", &dir, 0);
    let pair = connect(&mut a, &mut b).await?;

    let source = dir.join("refused.bin");
    write_test_file(&source, 10_000);
    let id = pair.a.send_file(&source).await?;

    a.wait_for("refusal", |e| {
        matches!(e, LifecycleEvent::Cancelled { transfer_id } if *transfer_id == id)
    })
    .await?;
    assert_eq!(a.registry.active_count(), 0);
    assert!(a.resume.load(id, "phone")?.is_none());
    assert!(!b.downloads().join("refused.bin").exists());
    Ok(())
}
