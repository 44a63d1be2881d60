//! Bidirectional splice between two channels
//!
//! Bridges a proxy-tunnel channel to a virtual-connection channel on
//! another connection so two peers can talk through a middleman. Each
//! direction runs its own piper task; the first direction to end takes the
//! whole joint down.

use super::channel::{ChannelHost, MuxChannel};
use super::CHANNEL_BUFFER_SIZE;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

pub struct Joint {
    id: u64,
    host: Weak<dyn ChannelHost>,
    a: Arc<MuxChannel>,
    b: Arc<MuxChannel>,
    disposed: AtomicBool,
}

impl Joint {
    /// Start piping between `a` and `b` and return the running joint
    pub(crate) fn splice(
        id: u64,
        host: Weak<dyn ChannelHost>,
        a: Arc<MuxChannel>,
        b: Arc<MuxChannel>,
    ) -> Arc<Self> {
        let joint = Arc::new(Self {
            id,
            host,
            a,
            b,
            disposed: AtomicBool::new(false),
        });

        tokio::spawn(joint.clone().pipe(joint.a.clone(), joint.b.clone()));
        tokio::spawn(joint.clone().pipe(joint.b.clone(), joint.a.clone()));

        joint
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    async fn pipe(self: Arc<Self>, src: Arc<MuxChannel>, dst: Arc<MuxChannel>) {
        let mut buf = vec![0u8; CHANNEL_BUFFER_SIZE];

        loop {
            let n = match src.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!(joint = self.id, error = %e, "joint read ended");
                    break;
                }
            };

            if let Err(e) = dst.write(&buf[..n]).await {
                debug!(joint = self.id, error = %e, "joint write ended");
                break;
            }
        }

        self.dispose().await;
    }

    /// Dispose both ends and detach from the owning connection. Idempotent;
    /// both pipers race into it when either direction terminates.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(joint = self.id, "joint disposed");

        self.a.dispose().await;
        self.b.dispose().await;

        if let Some(host) = self.host.upgrade() {
            host.detach_joint(self.id);
        }
    }
}
