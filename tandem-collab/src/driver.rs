//! Async driver for a [`CollabSession`].
//!
//! The session runs inside one spawned task. The task owns it exclusively and
//! multiplexes three sources with `select!`: commands from any number of
//! [`CollabHandle`] clones, transport events, and the session's next timer
//! deadline. Dropping every handle unloads the session and ends the task.

use tandem_core::Element;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::channel::ConnectionState;
use crate::host::SceneHost;
use crate::protocol::{PointerButton, PointerCoords};
use crate::session::{CollabSession, InitialScene};
use crate::transport::{Transport, TransportEvent};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("Session task has exited")]
    Stopped,
}

type HostFn<H> = Box<dyn FnOnce(&mut H) + Send>;

enum Command<H> {
    Start(oneshot::Sender<Option<oneshot::Receiver<InitialScene>>>),
    Stop {
        keep_remote_state: bool,
        done: oneshot::Sender<()>,
    },
    Unload(oneshot::Sender<()>),
    SyncElements(Vec<Element>),
    PointerUpdate {
        pointer: PointerCoords,
        button: PointerButton,
        active_pointers: usize,
    },
    PointerMove,
    VisibilityChange(bool),
    SetUsername(String),
    WithHost(HostFn<H>),
    State(oneshot::Sender<ConnectionState>),
}

/// Cloneable handle to a running session.
pub struct CollabHandle<H> {
    tx: mpsc::UnboundedSender<Command<H>>,
}

impl<H> Clone for CollabHandle<H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<H: SceneHost + 'static> CollabHandle<H> {
    /// Join the room. The inner receiver resolves with the initial scene.
    pub async fn start(&self) -> Result<Option<oneshot::Receiver<InitialScene>>, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Start(tx))?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    pub async fn stop(&self, keep_remote_state: bool) -> Result<(), DriverError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Stop {
            keep_remote_state,
            done,
        })?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    pub async fn unload(&self) -> Result<(), DriverError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Unload(done))?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    pub fn sync_elements(&self, elements: Vec<Element>) -> Result<(), DriverError> {
        self.send(Command::SyncElements(elements))
    }

    pub fn on_pointer_update(
        &self,
        pointer: PointerCoords,
        button: PointerButton,
        active_pointers: usize,
    ) -> Result<(), DriverError> {
        self.send(Command::PointerUpdate {
            pointer,
            button,
            active_pointers,
        })
    }

    pub fn on_pointer_move(&self) -> Result<(), DriverError> {
        self.send(Command::PointerMove)
    }

    pub fn on_visibility_change(&self, hidden: bool) -> Result<(), DriverError> {
        self.send(Command::VisibilityChange(hidden))
    }

    pub fn set_username(&self, name: impl Into<String>) -> Result<(), DriverError> {
        self.send(Command::SetUsername(name.into()))
    }

    /// Run `f` against the host inside the session task.
    pub async fn with_host<R, F>(&self, f: F) -> Result<R, DriverError>
    where
        R: Send + 'static,
        F: FnOnce(&mut H) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.send(Command::WithHost(Box::new(move |host: &mut H| {
            let _ = tx.send(f(host));
        })))?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    pub async fn state(&self) -> Result<ConnectionState, DriverError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::State(tx))?;
        rx.await.map_err(|_| DriverError::Stopped)
    }

    fn send(&self, command: Command<H>) -> Result<(), DriverError> {
        self.tx.send(command).map_err(|_| DriverError::Stopped)
    }
}

/// Spawn the session task.
///
/// `events` is the receiving end of the session's transport. The join handle
/// yields the session back once every [`CollabHandle`] is dropped.
pub fn spawn_session<H, T>(
    mut session: CollabSession<H, T>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) -> (CollabHandle<H>, JoinHandle<CollabSession<H, T>>)
where
    H: SceneHost + 'static,
    T: Transport + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Command<H>>();

    let task = tokio::spawn(async move {
        loop {
            let deadline = session.next_deadline();
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => apply(&mut session, command),
                    None => break,
                },
                Some(event) = events.recv() => {
                    session.handle_transport_event(event, Instant::now());
                }
                _ = timer => session.poll_timers(Instant::now()),
            }
        }
        log::debug!("All session handles dropped, unloading");
        session.unload();
        session
    });

    (CollabHandle { tx }, task)
}

fn apply<H: SceneHost, T: Transport>(session: &mut CollabSession<H, T>, command: Command<H>) {
    let now = Instant::now();
    match command {
        Command::Start(reply) => {
            let _ = reply.send(session.start(now));
        }
        Command::Stop {
            keep_remote_state,
            done,
        } => {
            session.stop(keep_remote_state);
            let _ = done.send(());
        }
        Command::Unload(done) => {
            session.unload();
            let _ = done.send(());
        }
        Command::SyncElements(elements) => session.sync_elements(&elements, now),
        Command::PointerUpdate {
            pointer,
            button,
            active_pointers,
        } => session.on_pointer_update(pointer, button, active_pointers, now),
        Command::PointerMove => session.on_pointer_move(now),
        Command::VisibilityChange(hidden) => session.on_visibility_change(hidden, now),
        Command::SetUsername(name) => session.set_username(name),
        Command::WithHost(f) => f(session.host_mut()),
        Command::State(reply) => {
            let _ = reply.send(session.state());
        }
    }
}
