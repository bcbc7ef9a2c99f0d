//! User actions delivered to a session running on its own task.
//!
//! The session handles commands, mailbox records and connection events one at
//! a time, so everything it owns is touched from a single logical thread.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SessionError;
use crate::session::{Phase, Session};

#[derive(Debug)]
pub enum Command {
    Login {
        username: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    Call {
        callee: String,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    EndCall {
        reply: oneshot::Sender<()>,
    },
    SetAudio {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    SetVideo {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    Phase {
        reply: oneshot::Sender<Phase>,
    },
    /// Tears the session down and stops the task.
    Shutdown,
}

/// Handle to a session driven by [`Client::spawn`].
#[derive(Debug, Clone)]
pub struct Client {
    tx: mpsc::UnboundedSender<Command>,
}

impl Client {
    pub fn spawn(session: Session) -> (Client, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(session, rx));
        (Client { tx }, task)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(command(reply))
            .map_err(|_| SessionError::SignalingState("session task has stopped".into()))?;
        rx.await
            .map_err(|_| SessionError::SignalingState("session task dropped the request".into()))
    }

    pub async fn login(&self, username: &str) -> Result<(), SessionError> {
        let username = username.to_owned();
        self.request(|reply| Command::Login { username, reply })
            .await?
    }

    pub async fn call(&self, callee: &str) -> Result<(), SessionError> {
        let callee = callee.to_owned();
        self.request(|reply| Command::Call { callee, reply }).await?
    }

    pub async fn end_call(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::EndCall { reply }).await
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        self.request(|reply| Command::SetAudio { enabled, reply })
            .await
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, SessionError> {
        self.request(|reply| Command::SetVideo { enabled, reply })
            .await
    }

    pub async fn phase(&self) -> Result<Phase, SessionError> {
        self.request(|reply| Command::Phase { reply }).await
    }

    pub fn shutdown(&self) {
        if self.tx.send(Command::Shutdown).is_err() {
            debug!("session task already stopped");
        }
    }
}

enum Next {
    Command(Option<Command>),
    Input(Option<crate::session::Input>),
}

async fn drive(mut session: Session, mut commands: mpsc::UnboundedReceiver<Command>) {
    loop {
        let listening = session.is_listening();
        let next = tokio::select! {
            command = commands.recv() => Next::Command(command),
            input = session.next_input(), if listening => Next::Input(input),
        };

        match next {
            Next::Command(Some(Command::Shutdown)) | Next::Command(None) => break,
            Next::Command(Some(command)) => handle(&mut session, command).await,
            Next::Input(Some(input)) => session.handle_input(input).await,
            Next::Input(None) => {}
        }
    }

    session.teardown().await;
    debug!("session task stopped");
}

async fn handle(session: &mut Session, command: Command) {
    match command {
        Command::Login { username, reply } => {
            let result = session.login(&username).await;
            if let Err(e) = &result {
                warn!("login as {username} failed: {e}");
            }
            let _ = reply.send(result);
        }
        Command::Call { callee, reply } => {
            let _ = reply.send(session.call(&callee).await);
        }
        Command::EndCall { reply } => {
            session.end_call().await;
            let _ = reply.send(());
        }
        Command::SetAudio { enabled, reply } => {
            let _ = reply.send(session.set_audio_enabled(enabled));
        }
        Command::SetVideo { enabled, reply } => {
            let _ = reply.send(session.set_video_enabled(enabled));
        }
        Command::Phase { reply } => {
            let _ = reply.send(session.phase());
        }
        Command::Shutdown => {}
    }
}
