use crate::*;

use skiff_services::HandshakeError;

#[tokio::test]
async fn test_handshake_establishes_shared_session() -> Result<()> {
    let dir = temp_dir("hs");
    let a = Node::new("laptop", &dir);
    let b = Node::new("phone", &dir);

    let (sa, sb) = establish_pair(&a, &b).await?;
    assert_eq!(sa.outcome.session_id, sb.outcome.session_id);
    assert_eq!(sa.peer_device(), "phone");
    assert_eq!(sb.peer_device(), "laptop");
    assert!(sa.channel.has_session_key());
    assert!(sb.channel.has_session_key());
    Ok(())
}

#[tokio::test]
async fn test_handshake_against_silent_peer_times_out() -> Result<()> {
    let dir = temp_dir("hs-silent");
    let mut a = Node::new("laptop", &dir);
    a.session.handshake.timeout = Duration::from_millis(100);

    // Nothing ever answers on the other end.
    let (local, _remote) = duplex(1 << 16);
    let err = match establish(local, &a.session).await {
        Ok(_) => bail!("handshake with a silent peer succeeded"),
        Err(e) => e,
    };
    assert!(matches!(err, HandshakeError::Timeout(_)), "got {err}");
    Ok(())
}

#[tokio::test]
async fn test_transfers_wait_for_attach() -> Result<()> {
    let dir = temp_dir("hs-unattached");
    let a = Node::new("laptop", &dir);
    let source = dir.join("early.txt");
    write_test_file(&source, 64);

    let err = a.orchestrator().send_file(&source).await.unwrap_err();
    assert_eq!(err.to_string(), "no connected peer");
    assert_eq!(a.registry.active_count(), 0);
    Ok(())
}
