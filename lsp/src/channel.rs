//! Point-to-point message channel between the host and the transport process.
//!
//! The host binds two loopback listeners and hands their ports to the
//! transport. Messages queued before the transport connects are delivered
//! once it does. The receive side never blocks: a notifier callback fires
//! when messages arrive and the owner drains them with
//! [`MessageChannel::recv_available`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use tokio::io::BufReader;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use crate::error::LspError;
use crate::jsonrpc::Message;
use crate::jsonrpc::read_message;
use crate::jsonrpc::write_message;

pub const LOCALHOST: &str = "127.0.0.1";
pub const DEFAULT_SEND_CAPACITY: usize = 1000;

type NotifyFn = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inbox {
    queue: VecDeque<Message>,
    closed: Option<String>,
    close_reported: bool,
}

#[derive(Default)]
struct Shared {
    inbox: Mutex<Inbox>,
    armed: AtomicBool,
    notify: Mutex<Option<NotifyFn>>,
}

impl Shared {
    fn inbox(&self) -> MutexGuard<'_, Inbox> {
        self.inbox
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fires the notifier if armed, disarming it.
    fn fire(&self) {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return;
        }
        let notify = self
            .notify
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(notify) = notify.as_ref() {
            notify();
        }
    }

    fn has_pending(&self) -> bool {
        let inbox = self.inbox();
        !inbox.queue.is_empty() || (inbox.closed.is_some() && !inbox.close_reported)
    }
}

pub struct MessageChannel {
    out_port: u16,
    in_port: u16,
    out_tx: Option<mpsc::Sender<Message>>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl MessageChannel {
    pub async fn open() -> Result<Self, LspError> {
        Self::open_with_capacity(DEFAULT_SEND_CAPACITY).await
    }

    /// Binds the "to-transport" and "from-transport" listeners on loopback.
    pub async fn open_with_capacity(capacity: usize) -> Result<Self, LspError> {
        let out_listener = TcpListener::bind((LOCALHOST, 0)).await?;
        let in_listener = TcpListener::bind((LOCALHOST, 0)).await?;
        let out_port = out_listener.local_addr()?.port();
        let in_port = in_listener.local_addr()?.port();

        let shared = Arc::new(Shared::default());
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(capacity.max(1));

        let writer_shared = Arc::clone(&shared);
        let writer = tokio::spawn(async move {
            let (stream, peer) = match out_listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    mark_closed(&writer_shared, format!("accept failed: {err}"));
                    return;
                }
            };
            debug!(%peer, "transport connected to the outgoing socket");
            let (_read, mut write) = stream.into_split();
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = write_message(&mut write, &msg).await {
                    mark_closed(&writer_shared, format!("write failed: {err}"));
                    return;
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let (stream, peer) = match in_listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    mark_closed(&reader_shared, format!("accept failed: {err}"));
                    return;
                }
            };
            debug!(%peer, "transport connected to the incoming socket");
            let mut reader = BufReader::new(stream);
            loop {
                match read_message(&mut reader).await {
                    Ok(msg) => {
                        reader_shared.inbox().queue.push_back(msg);
                        reader_shared.fire();
                    }
                    Err(err) if err.is_recoverable() => {
                        warn!("dropping malformed message from transport: {err}");
                    }
                    Err(err) => {
                        mark_closed(&reader_shared, err.to_string());
                        return;
                    }
                }
            }
        });

        Ok(Self {
            out_port,
            in_port,
            out_tx: Some(out_tx),
            shared,
            tasks: vec![writer, reader],
        })
    }

    /// Port the transport reads host messages from.
    pub fn out_port(&self) -> u16 {
        self.out_port
    }

    /// Port the transport writes its messages to.
    pub fn in_port(&self) -> u16 {
        self.in_port
    }

    /// Queues `msg` without waiting. A full queue is reported as
    /// [`LspError::ChannelFull`] so the caller decides how long to retry.
    pub fn send(&self, msg: Message) -> Result<(), LspError> {
        let Some(out_tx) = &self.out_tx else {
            return Err(LspError::ChannelClosed("channel was closed".to_string()));
        };
        match out_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(LspError::ChannelFull(0)),
            Err(TrySendError::Closed(_)) => Err(LspError::ChannelClosed(
                self.closed_reason()
                    .unwrap_or_else(|| "writer stopped".to_string()),
            )),
        }
    }

    /// Takes every message received so far.
    ///
    /// Once the peer is gone and the queue is empty this returns
    /// [`LspError::ChannelClosed`] exactly once; later calls return an empty
    /// batch.
    pub fn recv_available(&self) -> Result<Vec<Message>, LspError> {
        let mut inbox = self.shared.inbox();
        let drained: Vec<Message> = inbox.queue.drain(..).collect();
        if drained.is_empty() && !inbox.close_reported {
            if let Some(reason) = inbox.closed.clone() {
                inbox.close_reported = true;
                return Err(LspError::ChannelClosed(reason));
            }
        }
        Ok(drained)
    }

    /// Installs the readiness callback and arms it.
    pub fn install_notifier<F>(&self, notify: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self
            .shared
            .notify
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(notify));
        self.rearm();
    }

    /// Disarms the notifier for the length of a drain.
    pub fn disarm(&self) {
        self.shared.armed.store(false, Ordering::Release);
    }

    /// Re-arms the notifier, firing it right away if anything is pending.
    pub fn rearm(&self) {
        self.shared.armed.store(true, Ordering::Release);
        if self.shared.has_pending() {
            self.shared.fire();
        }
    }

    pub fn remove_notifier(&self) {
        self.disarm();
        *self
            .shared
            .notify
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = None;
    }

    pub fn is_closed(&self) -> bool {
        self.out_tx.is_none() || self.shared.inbox().closed.is_some()
    }

    fn closed_reason(&self) -> Option<String> {
        self.shared.inbox().closed.clone()
    }

    pub fn close(&mut self) {
        if self.out_tx.take().is_none() {
            return;
        }
        self.remove_notifier();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MessageChannel {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn mark_closed(shared: &Shared, reason: String) {
    {
        let mut inbox = shared.inbox();
        if inbox.closed.is_none() {
            debug!("message channel closed: {reason}");
            inbox.closed = Some(reason);
        }
    }
    shared.fire();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::Notify;

    struct Peer {
        from_host: BufReader<TcpStream>,
        to_host: TcpStream,
    }

    async fn connect(channel: &MessageChannel) -> Peer {
        let from_host = TcpStream::connect((LOCALHOST, channel.out_port()))
            .await
            .unwrap();
        let to_host = TcpStream::connect((LOCALHOST, channel.in_port()))
            .await
            .unwrap();
        Peer {
            from_host: BufReader::new(from_host),
            to_host,
        }
    }

    #[tokio::test]
    async fn messages_queued_before_connect_are_delivered() {
        let channel = MessageChannel::open().await.unwrap();
        channel
            .send(Message::notification("initialized", json!({})))
            .unwrap();

        let mut peer = connect(&channel).await;
        let msg = read_message(&mut peer.from_host).await.unwrap();
        assert_eq!(msg.method.as_deref(), Some("initialized"));
    }

    #[tokio::test]
    async fn notifier_fires_and_drain_returns_in_order() {
        let channel = MessageChannel::open().await.unwrap();
        let ready = Arc::new(Notify::new());
        let waker = Arc::clone(&ready);
        channel.install_notifier(move || waker.notify_one());

        let mut peer = connect(&channel).await;
        for pid in [1, 2] {
            write_message(
                &mut peer.to_host,
                &Message::notification("server_ready", json!({"pid": pid})),
            )
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 2 {
            tokio::time::timeout(Duration::from_secs(5), ready.notified())
                .await
                .unwrap();
            channel.disarm();
            seen.extend(channel.recv_available().unwrap());
            channel.rearm();
        }
        let pids: Vec<_> = seen
            .iter()
            .map(|msg| msg.params.as_ref().unwrap()["pid"].clone())
            .collect();
        assert_eq!(pids, vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn full_queue_reports_channel_full() {
        let channel = MessageChannel::open_with_capacity(2).await.unwrap();
        for _ in 0..2 {
            channel
                .send(Message::notification("textDocument/didChange", json!({})))
                .unwrap();
        }
        let err = channel
            .send(Message::notification("textDocument/didChange", json!({})))
            .unwrap_err();
        assert!(matches!(err, LspError::ChannelFull(_)));
    }

    #[tokio::test]
    async fn peer_disconnect_is_reported_once() {
        let channel = MessageChannel::open().await.unwrap();
        let peer = connect(&channel).await;
        drop(peer);

        let closed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match channel.recv_available() {
                    Err(LspError::ChannelClosed(_)) => break,
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await;
        assert!(closed.is_ok());
        assert!(channel.recv_available().unwrap().is_empty());
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut channel = MessageChannel::open().await.unwrap();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send(Message::notification("exit", json!({}))),
            Err(LspError::ChannelClosed(_))
        ));
    }
}
