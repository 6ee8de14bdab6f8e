use anyhow::Result;
use filedrop_core::{MemoryRendezvous, OutgoingFile, TransferEvent};
use filedrop_rtc::{PendingSession, SessionOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Two real peer connections in one process, paired through an in-memory
/// rendezvous. Host candidates only, so no STUN traffic leaves the machine.
#[tokio::test]
#[ignore = "needs a non-loopback network interface for ICE host candidates"]
async fn test_rtc_session_transfers_file() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .try_init()
        .ok();

    let rendezvous = Arc::new(MemoryRendezvous::new());
    let options = SessionOptions {
        stun_servers: Vec::new(),
        poll_interval: Duration::from_millis(50),
        ..SessionOptions::default()
    };

    let host = PendingSession::host_rtc(rendezvous.clone(), &options).await?;
    let guest = PendingSession::join_rtc(&host.join_payload(), rendezvous, &options).await?;

    let (host_tx, _host_rx) = mpsc::channel(256);
    let (guest_tx, mut guest_rx) = mpsc::channel(256);
    let (host, guest) = tokio::time::timeout(Duration::from_secs(30), async {
        tokio::join!(host.connect(host_tx), guest.connect(guest_tx))
    })
    .await?;
    let host = host?;
    let guest = guest?;

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    host.transfers()
        .send_files(vec![OutgoingFile::from_bytes("data.bin", "", data.clone())])
        .await?;

    let received = tokio::time::timeout(Duration::from_secs(30), async {
        let mut received = None;
        while let Some(event) = guest_rx.recv().await {
            match event {
                TransferEvent::IncomingManifest { .. } => guest.transfers().accept().await?,
                TransferEvent::FileReceived(file) => received = Some(file),
                TransferEvent::BatchCompleted { .. } => break,
                _ => {}
            }
        }
        anyhow::Ok(received)
    })
    .await??;

    assert_eq!(received.map(|f| f.data.to_vec()), Some(data));

    host.close().await?;
    guest.close().await?;
    Ok(())
}
