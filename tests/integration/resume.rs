use crate::*;

use skiff_core::crypto;
use skiff_services::{
    ChannelConfig, Direction, ReliabilityConfig, ResumeState, TransferError, TransferStatus,
};

/// Chunk size `TransportProfile::standard()` negotiates.
const CHUNK: u32 = 256 * 1024;

/// Leave both nodes as if an earlier session had moved `done` of the file's
/// chunks: matching resume state on each side, and the received prefix on
/// disk at the receiver.
fn seed_interrupted(
    a: &Node,
    b: &Node,
    id: u32,
    source: &Path,
    data: &[u8],
    done: u64,
) -> Result<()> {
    let hash = crypto::hash(data);
    let name = source.file_name().and_then(|n| n.to_str()).context("file name")?;
    let dest = b.downloads().join(name);
    std::fs::create_dir_all(b.downloads())?;
    let mut partial = data[..(done * CHUNK as u64) as usize].to_vec();
    partial.resize(data.len(), 0);
    std::fs::write(&dest, &partial)?;

    let size = data.len() as u64;
    let mut sent = ResumeState::new(id, &b.device, Direction::Send, source, name, size, CHUNK, Some(hash));
    let mut received = ResumeState::new(id, &a.device, Direction::Receive, &dest, name, size, CHUNK, Some(hash));
    for index in 0..done {
        sent.mark(index);
        received.mark(index);
    }
    a.resume.save(sent);
    b.resume.save(received);
    Ok(())
}

/// Interrupted at 60 %, resumed after both sides restart: only the missing
/// 40 % crosses the wire and the result is byte-identical.
#[tokio::test]
async fn test_resume_sends_only_missing_chunks() -> Result<()> {
    let dir = temp_dir("resume");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    a.resume = ResumeStore::open_dir(dir.join("state-a"))?;
    b.resume = ResumeStore::open_dir(dir.join("state-b"))?;

    let source = dir.join("video.mp4");
    let data = write_test_file(&source, 10 * CHUNK as usize);
    let id = 0x5eed_0001;
    seed_interrupted(&a, &b, id, &source, &data, 6)?;

    // Fresh store instances read the persisted state back from disk.
    a.resume = ResumeStore::open_dir(dir.join("state-a"))?;
    b.resume = ResumeStore::open_dir(dir.join("state-b"))?;

    let pair = connect(&mut a, &mut b).await?;
    pair.a.resume_transfer(id).await?;

    let resumed = a
        .wait_for("sender resumed", |e| matches!(e, LifecycleEvent::Resumed { .. }))
        .await?;
    assert_eq!(
        resumed,
        LifecycleEvent::Resumed {
            transfer_id: id,
            direction: Direction::Send,
            remaining_chunks: 4,
        }
    );
    let resumed = b
        .wait_for("receiver resumed", |e| matches!(e, LifecycleEvent::Resumed { .. }))
        .await?;
    assert!(matches!(
        resumed,
        LifecycleEvent::Resumed { remaining_chunks: 4, direction: Direction::Receive, .. }
    ));

    a.wait_for("sender completion", is_completed(id)).await?;
    b.wait_for("receiver completion", is_completed(id)).await?;

    let received = std::fs::read(b.downloads().join("video.mp4"))?;
    assert!(received == data, "resumed file differs from source");

    let stats = pair.a_channel.stats();
    println!("sender stats: {stats:?}");
    assert_eq!(stats.data_frames_out - stats.retransmissions, 4);

    assert!(a.resume.load(id, "phone")?.is_none());
    assert!(b.resume.load(id, "laptop")?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_resume_without_state_is_an_error() -> Result<()> {
    let dir = temp_dir("resume-missing");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    let pair = connect(&mut a, &mut b).await?;

    let err = pair.a.resume_transfer(42).await.unwrap_err();
    assert!(matches!(err, TransferError::NoResumeState(42)), "got {err}");
    assert_eq!(a.registry.active_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_resume_rejects_changed_source() -> Result<()> {
    let dir = temp_dir("resume-changed");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);

    let source = dir.join("draft.txt");
    let data = write_test_file(&source, 3 * CHUNK as usize);
    seed_interrupted(&a, &b, 7, &source, &data, 1)?;

    // Same length, different bytes.
    let mut edited = data.clone();
    edited[CHUNK as usize + 5] ^= 0xff;
    std::fs::write(&source, &edited)?;

    let pair = connect(&mut a, &mut b).await?;
    let err = pair.a.resume_transfer(7).await.unwrap_err();
    assert!(matches!(err, TransferError::SourceChanged(_)), "got {err}");
    assert_eq!(a.registry.active_count(), 0);
    // still there for a later attempt once the file is restored
    assert!(a.resume.load(7, "phone")?.is_some());

    let paused = pair.a.status(7).context("paused transfer has a status")?;
    assert_eq!(paused.status, TransferStatus::Paused);
    assert_eq!(paused.bytes_done, CHUNK as u64);
    assert_eq!(paused.direction, Direction::Send);
    let listed = pair.b.list();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, TransferStatus::Paused);
    assert_eq!(listed[0].direction, Direction::Receive);
    Ok(())
}

/// A receiver with no record of the transfer cannot take a partial resend,
/// so it refuses and the sender sees the transfer cancelled.
#[tokio::test]
async fn test_resume_offer_without_receiver_state_is_refused() -> Result<()> {
    let dir = temp_dir("resume-refused");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);

    let source = dir.join("photo.raw");
    let data = write_test_file(&source, 4 * CHUNK as usize);
    seed_interrupted(&a, &b, 9, &source, &data, 2)?;
    b.resume.delete(9, "laptop");

    let pair = connect(&mut a, &mut b).await?;
    pair.a.resume_transfer(9).await?;
    a.wait_for("refusal", |e| {
        matches!(e, LifecycleEvent::Cancelled { transfer_id: 9 })
    })
    .await?;
    assert_eq!(a.registry.active_count(), 0);
    assert_eq!(b.registry.active_count(), 0);
    Ok(())
}

/// A transfer that gives up after exhausting its retries keeps resume state
/// on both sides, and a later resume finishes it.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_transfer_can_be_resumed() -> Result<()> {
    let dir = temp_dir("resume-after-failure");
    let mut a = Node::new("laptop", &dir);
    let mut b = Node::new("phone", &dir);
    a.session.channel = ChannelConfig {
        reliability: ReliabilityConfig {
            window: 4,
            ack_timeout: Duration::from_millis(50),
            max_retries: 1,
        },
        tick_interval: Duration::from_millis(10),
        ..ChannelConfig::default()
    };

    let (sa, sb) = establish_pair(&a, &b).await?;
    let sender = a.orchestrator();
    let _a_task = spawn_session(&sender, sa);
    a.wait_for("a connected", is_connected).await?;

    // More chunks than the window, so the receiver can never have them all
    // before the sender gives up.
    let source = dir.join("archive.zip");
    let data = write_test_file(&source, 6 * CHUNK as usize);
    let id = sender.send_file(&source).await?;

    // Nobody acknowledges yet: the receiver is not processing its session.
    let failed = a
        .wait_for("sender failure", |e| {
            matches!(e, LifecycleEvent::Failed { transfer_id, .. } if *transfer_id == id)
        })
        .await?;
    println!("sender gave up: {failed:?}");
    assert!(a.resume.load(id, "phone")?.is_some());

    let receiver = b.orchestrator();
    let _b_task = spawn_session(&receiver, sb);
    b.wait_for("receiver failure", |e| {
        matches!(e, LifecycleEvent::Failed { transfer_id, .. } if *transfer_id == id)
    })
    .await?;
    assert!(b.resume.load(id, "laptop")?.is_some());
    assert!(a.resume.load(id, "phone")?.is_some());
    assert_eq!(b.registry.active_count(), 0);

    sender.resume_transfer(id).await?;
    a.wait_for("sender completion", is_completed(id)).await?;
    b.wait_for("receiver completion", is_completed(id)).await?;

    let received = std::fs::read(b.downloads().join("archive.zip"))?;
    assert!(received == data, "file differs after resuming a failed transfer");
    assert!(a.resume.load(id, "phone")?.is_none());
    assert!(b.resume.load(id, "laptop")?.is_none());
    Ok(())
}
