//! The forwarding protocol: line-framed JSON over the machine node's
//! stderr, replayed into observers on the invoking side.

use std::{
    io::{BufRead, Write},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};

use crate::{
    observer::{Action, Observer, Observers},
    subject::corpus::builder,
    sync::{Context, SessionError},
};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("corrupt forwarding line {line:?}: {source}")]
    Corrupt {
        line: String,
        source: serde_json::Error,
    },
    #[error("machine node reported: {0}")]
    Remote(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One protocol record.  Exactly one field is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<builder::Request>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An observer that encodes everything it sees onto a writer, one JSON
/// object per line.
pub struct ForwardObserver<W: Write + Send> {
    w: Mutex<W>,
}

impl<W: Write + Send> std::fmt::Debug for ForwardObserver<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ForwardObserver")
    }
}

impl<W: Write + Send> ForwardObserver<W> {
    pub fn new(w: W) -> Self {
        Self { w: Mutex::new(w) }
    }

    /// Reports a fatal machine-node error to the other side.
    pub fn forward_error(&self, msg: &str) {
        self.send(&Forward {
            error: Some(msg.to_owned()),
            ..Forward::default()
        });
    }

    fn send(&self, f: &Forward) {
        let Ok(mut w) = self.w.lock() else { return };
        // A dead pipe means the invoker is gone; nothing useful to do.
        if let Ok(line) = serde_json::to_string(f) {
            let _ = writeln!(w, "{line}");
            let _ = w.flush();
        }
    }
}

impl<W: Write + Send> Observer for ForwardObserver<W> {
    fn on_build_request(&self, r: &builder::Request) {
        self.send(&Forward {
            build: Some(r.clone()),
            ..Forward::default()
        });
    }

    fn on_machine_action(&self, a: &Action) {
        self.send(&Forward {
            action: Some(*a),
            ..Forward::default()
        });
    }
}

/// Decodes a forwarding stream, dispatching each record to `observers`.
///
/// EOF is normal termination; a line that does not parse ends the stream
/// with [`ProtocolError::Corrupt`], and a forwarded error ends it with
/// [`ProtocolError::Remote`].
pub fn replay(
    ctx: &Context,
    r: impl BufRead,
    observers: &Observers,
) -> Result<(), ProtocolError> {
    for line in r.lines() {
        ctx.check()?;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let forward: Forward =
            serde_json::from_str(&line).map_err(|source| ProtocolError::Corrupt {
                line: line.clone(),
                source,
            })?;
        if let Some(req) = forward.build {
            observers.on_build_request(&req);
        }
        if let Some(action) = forward.action {
            observers.on_machine_action(&action);
        }
        if let Some(err) = forward.error {
            return Err(ProtocolError::Remote(err));
        }
    }
    Ok(())
}
