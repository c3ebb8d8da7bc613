//! Command protocol: COMMAND_LONG with acknowledgment and retry.
//!
//! [`CommandSender`] transmits a command and re-sends it until COMMAND_ACK
//! arrives or the retry budget is exhausted. Commands to different targets, or
//! different commands to the same target, are in flight concurrently; only a
//! duplicate of a pending command is rejected.
//!
//! [`CommandReceiver`] is the responder side: registered handlers answer
//! incoming COMMAND_LONG frames with COMMAND_ACK.

use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use mavio::dialects::common::enums::{MavCmd, MavResult};
use mavio::dialects::common::messages::{CommandAck, CommandLong};
use mavio::protocol::{Endpoint, Versionless, V2};
use mavio::Frame;

use crate::consts::{COMMAND_RETRIES, COMMAND_TIMEOUT};
use crate::io::SendFrame;
use crate::protocol::{msg_id, Common};
use crate::router::Router;
use crate::utils::{Cookie, TimeoutHandler};

use crate::prelude::*;

/// Outcome of a sent command.
///
/// Every variant except [`InProgress`](CommandResult::InProgress) is terminal
/// and delivered exactly once.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CommandResult {
    /// Command accepted and executed.
    Success,
    /// Temporarily rejected; retrying later may work.
    TemporarilyRejected,
    /// Denied.
    Denied,
    /// Target does not support this command.
    Unsupported,
    /// Execution failed.
    Failed,
    /// Execution progress report; `None` when the target reports no figure.
    InProgress(Option<f32>),
    /// No acknowledgment within the retry budget.
    Timeout,
    /// Transport failure while (re-)sending.
    ConnectionError,
}

fn map_ack_result(result: MavResult) -> CommandResult {
    match result {
        MavResult::Accepted => CommandResult::Success,
        MavResult::TemporarilyRejected => CommandResult::TemporarilyRejected,
        MavResult::Denied => CommandResult::Denied,
        MavResult::Unsupported => CommandResult::Unsupported,
        _ => CommandResult::Failed,
    }
}

/// A command to send.
#[derive(Clone, Debug)]
pub struct Command {
    /// Target system `ID`.
    pub target_system: u8,
    /// Target component `ID`.
    pub target_component: u8,
    /// Command to schedule.
    pub command: MavCmd,
    /// Command-dependent parameters.
    pub params: [f32; 7],
}

type Callback = Box<dyn FnMut(CommandResult) + Send>;
type PendingKey = (u32, u8);

struct PendingCommand {
    message: CommandLong,
    retries_left: usize,
    cookie: Cookie,
    callback: Arc<Mutex<Callback>>,
}

struct CommandSenderInner {
    sender: Arc<dyn SendFrame>,
    endpoint: Arc<Endpoint<V2>>,
    timeouts: TimeoutHandler,
    timeout: Duration,
    retries: usize,
    pending: Mutex<HashMap<PendingKey, PendingCommand>>,
}

/// Command sender with acknowledgment tracking.
#[derive(Clone)]
pub struct CommandSender {
    inner: Arc<CommandSenderInner>,
}

impl CommandSender {
    /// Creates a sender wired into `router` with default retry settings.
    pub fn new(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        timeouts: TimeoutHandler,
    ) -> Self {
        Self::with_retry(
            sender,
            endpoint,
            router,
            timeouts,
            COMMAND_TIMEOUT,
            COMMAND_RETRIES,
        )
    }

    /// Creates a sender with an explicit re-send interval and budget.
    pub fn with_retry(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        timeouts: TimeoutHandler,
        timeout: Duration,
        retries: usize,
    ) -> Self {
        let inner = Arc::new(CommandSenderInner {
            sender,
            endpoint,
            timeouts,
            timeout,
            retries,
            pending: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::COMMAND_ACK, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_ack(frame);
            }
        });

        Self { inner }
    }

    /// Sends `command` and reports its outcome through `callback`.
    ///
    /// The callback may be invoked several times with
    /// [`CommandResult::InProgress`] before the single terminal result.
    /// Fails synchronously with [`Error::CommandBusy`] if the same command is
    /// already pending for the same target, and with the transport error if
    /// the initial send fails.
    pub fn send(
        &self,
        command: Command,
        callback: impl FnMut(CommandResult) + Send + 'static,
    ) -> Result<()> {
        let key: PendingKey = (command.command as u32, command.target_system);
        let message = CommandLong {
            target_system: command.target_system,
            target_component: command.target_component,
            command: command.command,
            confirmation: 0,
            param1: command.params[0],
            param2: command.params[1],
            param3: command.params[2],
            param4: command.params[3],
            param5: command.params[4],
            param6: command.params[5],
            param7: command.params[6],
        };

        {
            let pending = self.inner.pending.lock().unwrap();
            if pending.contains_key(&key) {
                return Err(Error::CommandBusy);
            }
        }

        let frame = self.inner.endpoint.next_frame(&message)?;
        self.inner.sender.send_frame(&frame)?;

        let cookie = self.inner.arm_timeout(key);
        self.inner.pending.lock().unwrap().insert(
            key,
            PendingCommand {
                message,
                retries_left: self.inner.retries,
                cookie,
                callback: Arc::new(Mutex::new(Box::new(callback))),
            },
        );

        log::trace!(
            "command {:?} sent to system {}",
            command.command,
            command.target_system
        );
        Ok(())
    }

    /// Sends `command` and blocks until the terminal result.
    ///
    /// Progress reports are discarded.
    pub fn send_blocking(&self, command: Command) -> CommandResult {
        let (tx, rx) = mpsc::channel();
        let result = self.send(command, move |result| {
            if !matches!(result, CommandResult::InProgress(_)) {
                let _ = tx.send(result);
            }
        });

        match result {
            Ok(()) => rx.recv().unwrap_or(CommandResult::ConnectionError),
            Err(Error::CommandBusy) => CommandResult::TemporarilyRejected,
            Err(_) => CommandResult::ConnectionError,
        }
    }
}

impl CommandSenderInner {
    fn arm_timeout(self: &Arc<Self>, key: PendingKey) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_timeout(key);
            }
        })
    }

    fn on_ack(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let ack = match frame.decode() {
            Ok(Common::CommandAck(ack)) => ack,
            _ => return,
        };

        let key: PendingKey = (ack.command as u32, frame.system_id());

        if matches!(ack.result, MavResult::InProgress) {
            let callback = {
                let mut pending = self.pending.lock().unwrap();
                let Some(entry) = pending.get_mut(&key) else {
                    return;
                };
                // Progress resets the retry budget and postpones the deadline.
                entry.retries_left = self.retries;
                self.timeouts.refresh(entry.cookie);
                entry.callback.clone()
            };

            let progress = match ack.progress {
                u8::MAX => None,
                percent => Some(f32::from(percent) / 100.0),
            };
            (callback.lock().unwrap())(CommandResult::InProgress(progress));
            return;
        }

        let Some(entry) = self.pending.lock().unwrap().remove(&key) else {
            log::debug!(
                "unexpected COMMAND_ACK for {:?} from system {}",
                ack.command,
                frame.system_id()
            );
            return;
        };
        self.timeouts.remove(entry.cookie);

        let result = map_ack_result(ack.result);
        log::trace!(
            "command {:?} finished with {result:?} (system {})",
            ack.command,
            frame.system_id()
        );
        (entry.callback.lock().unwrap())(result);
    }

    fn on_timeout(self: &Arc<Self>, key: PendingKey) {
        enum Action {
            Finish(Arc<Mutex<Callback>>, CommandResult),
            Resend(CommandLong, Arc<Mutex<Callback>>),
        }

        let action = {
            let mut pending = self.pending.lock().unwrap();
            let Some(entry) = pending.get_mut(&key) else {
                return;
            };

            if entry.retries_left == 0 {
                let entry = pending.remove(&key).unwrap();
                Action::Finish(entry.callback, CommandResult::Timeout)
            } else {
                entry.retries_left -= 1;
                entry.cookie = self.arm_timeout(key);
                Action::Resend(entry.message.clone(), entry.callback.clone())
            }
        };

        match action {
            Action::Finish(callback, result) => {
                log::debug!("command to system {} timed out", key.1);
                (callback.lock().unwrap())(result);
            }
            Action::Resend(message, callback) => {
                log::trace!("re-sending command to system {}", key.1);
                let sent = match self.endpoint.next_frame(&message) {
                    Ok(frame) => self.sender.send_frame(&frame),
                    Err(err) => Err(err.into()),
                };
                if sent.is_err() {
                    self.pending.lock().unwrap().remove(&key);
                    (callback.lock().unwrap())(CommandResult::ConnectionError);
                }
            }
        }
    }
}

/// Handler answering one command `ID`.
pub type CommandHandler = Box<dyn Fn(&CommandLong) -> MavResult + Send + Sync>;

struct CommandReceiverInner {
    sender: Arc<dyn SendFrame>,
    endpoint: Arc<Endpoint<V2>>,
    own_system_id: u8,
    handlers: Mutex<HashMap<u32, CommandHandler>>,
}

/// Responder side of the command protocol.
///
/// Commands addressed to this node (or broadcast) are answered with a
/// COMMAND_ACK carrying the registered handler's result; commands without a
/// handler are acknowledged as unsupported.
#[derive(Clone)]
pub struct CommandReceiver {
    inner: Arc<CommandReceiverInner>,
}

impl CommandReceiver {
    /// Creates a receiver wired into `router`.
    pub fn new(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        own_system_id: u8,
    ) -> Self {
        let inner = Arc::new(CommandReceiverInner {
            sender,
            endpoint,
            own_system_id,
            handlers: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::COMMAND_LONG, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_command(frame);
            }
        });

        Self { inner }
    }

    /// Registers (or replaces) the handler for `command`.
    pub fn register_handler(
        &self,
        command: MavCmd,
        handler: impl Fn(&CommandLong) -> MavResult + Send + Sync + 'static,
    ) {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(command as u32, Box::new(handler));
    }

    /// Removes the handler for `command`.
    pub fn unregister_handler(&self, command: MavCmd) {
        self.inner.handlers.lock().unwrap().remove(&(command as u32));
    }
}

impl CommandReceiverInner {
    fn on_command(&self, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::CommandLong(message)) => message,
            _ => return,
        };

        if message.target_system != 0 && message.target_system != self.own_system_id {
            return;
        }

        let result = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(&(message.command as u32)) {
                Some(handler) => handler(&message),
                None => MavResult::Unsupported,
            }
        };

        let ack = CommandAck {
            command: message.command,
            result,
            target_system: frame.system_id(),
            target_component: frame.component_id(),
            ..Default::default()
        };

        let sent = match self.endpoint.next_frame(&ack) {
            Ok(frame) => self.sender.send_frame(&frame),
            Err(err) => Err(err.into()),
        };
        if let Err(err) = sent {
            log::warn!("failed to send COMMAND_ACK: {err:?}");
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
