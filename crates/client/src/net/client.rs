use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::Notify;

use polynet::{ConnState, Connection, MsgDispatcher, MsgReceiver};

use super::config::ClientConfig;
use super::messages::{Hello, UserInfo};

/// Greets the server once connected and counts the greetings echoed back.
pub struct HelloClient {
    conn: Connection,
    config: ClientConfig,
    dispatcher: Arc<MsgDispatcher>,
    on_hello: MsgReceiver<Hello>,
    replies: Arc<AtomicU32>,
    all_replied: Arc<Notify>,
}

impl HelloClient {
    pub fn new(conn: Connection, config: ClientConfig, dispatcher: Arc<MsgDispatcher>) -> Self {
        let replies = Arc::new(AtomicU32::new(0));
        let all_replied = Arc::new(Notify::new());

        let on_hello = {
            let replies = replies.clone();
            let all_replied = all_replied.clone();
            let expected = config.hellos;
            MsgReceiver::new(move |hello: &Hello| {
                log::info!("Hello from {} (user {})", hello.name, hello.user.id);
                if replies.fetch_add(1, Ordering::SeqCst) + 1 >= expected {
                    all_replied.notify_one();
                }
                Ok(())
            })
        };
        dispatcher.register(&on_hello);

        let hello = Hello {
            name: config.name.clone(),
            user: UserInfo { id: config.user_id },
        };
        let count = config.hellos;
        conn.on_connected(move |conn| {
            log::info!("Connected over {} to {}", conn.kind(), conn.option().addr());
            for _ in 0..count {
                if let Err(e) = conn.send(&hello) {
                    log::error!("Failed to send hello: {}", e);
                    break;
                }
            }
        });

        let routes = dispatcher.clone();
        conn.on_message(move |_, msg| {
            routes.dispatch(msg);
        });

        conn.on_exception(|conn, err| {
            log::error!("Connection {} error: {}", conn.id(), err);
        });

        conn.on_closed(|conn| {
            let stats = conn.stats();
            log::info!(
                "Connection {} closed: {} sent, {} received",
                conn.id(),
                stats.messages_sent,
                stats.messages_received
            );
        });

        Self {
            conn,
            config,
            dispatcher,
            on_hello,
            replies,
            all_replied,
        }
    }

    /// Connects and waits until every hello is answered, the connection
    /// ends, the linger time runs out or ctrl-c is pressed. Returns the number
    /// of replies.
    pub async fn run(&self) -> anyhow::Result<u32> {
        self.conn.connect()?;

        let ended = self
            .conn
            .wait_for_state(|state| matches!(state, ConnState::Faulted | ConnState::Closed));
        tokio::select! {
            _ = self.all_replied.notified() => log::info!("All hellos answered"),
            state = ended => log::warn!("Connection ended early ({})", state),
            _ = tokio::time::sleep(self.config.linger) => {
                log::warn!("Gave up waiting after {:?}", self.config.linger);
            }
            _ = tokio::signal::ctrl_c() => log::info!("Interrupted"),
        }

        self.conn.close();
        self.conn
            .wait_for_state(|state| state == ConnState::Closed)
            .await;
        Ok(self.replies.load(Ordering::SeqCst))
    }
}

impl Drop for HelloClient {
    fn drop(&mut self) {
        self.dispatcher.unregister(&self.on_hello);
    }
}
