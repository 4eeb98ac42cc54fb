//! Scripted transport driving the client in tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::transport::{Transport, TransportError};

/// One step of a scripted exchange, in wire order
#[derive(Debug, Clone)]
pub(crate) enum Step {
    /// Expect a command write with exactly these bytes
    Command(String),
    /// Expect a `download:` command; accept it with a matching DATA reply
    /// and swallow the announced number of payload bytes
    Download,
    /// Serve these bytes for the next read
    Reply(String),
    /// Fail the next read with a transport error
    ReadError(TransportError),
}

#[derive(Debug, Default)]
pub(crate) struct SimState {
    steps: VecDeque<Step>,
    pending_replies: VecDeque<Vec<u8>>,
    data_left: usize,
    current_download: Vec<u8>,
    pub downloads: Vec<Vec<u8>>,
    pub commands: Vec<String>,
    pub closed: bool,
}

/// Shared view on the simulated device for assertions
#[derive(Clone)]
pub(crate) struct SimHandle(Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn downloads(&self) -> Vec<Vec<u8>> {
        self.0.lock().unwrap().downloads.clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.0.lock().unwrap().commands.clone()
    }

    /// Payload bytes received so far, completed downloads and the partial
    /// one included
    pub fn data_written(&self) -> usize {
        let state = self.0.lock().unwrap();
        state.downloads.iter().map(|d| d.len()).sum::<usize>() + state.current_download.len()
    }

    pub fn closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }

    pub fn steps_left(&self) -> usize {
        self.0.lock().unwrap().steps.len()
    }
}

pub(crate) struct ScriptedTransport {
    state: Arc<Mutex<SimState>>,
    max_transfer: usize,
}

pub(crate) fn scripted(steps: Vec<Step>) -> (Box<dyn Transport>, SimHandle) {
    scripted_with_transfer_size(steps, 1024 * 1024)
}

pub(crate) fn scripted_with_transfer_size(
    steps: Vec<Step>,
    max_transfer: usize,
) -> (Box<dyn Transport>, SimHandle) {
    let state = Arc::new(Mutex::new(SimState {
        steps: steps.into(),
        ..Default::default()
    }));
    (
        Box::new(ScriptedTransport {
            state: state.clone(),
            max_transfer,
        }),
        SimHandle(state),
    )
}

/// Steps serving the `getvar:all` of [crate::FastbootClient::connect]
pub(crate) fn connect_steps(vars: &[(&str, &str)]) -> Vec<Step> {
    let mut steps = vec![Step::Command("getvar:all".into())];
    for (key, value) in vars {
        steps.push(Step::Reply(format!("INFO{key}:{value}")));
    }
    steps.push(Step::Reply("OKAY".into()));
    steps
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn write(&mut self, data: &[u8], _timeout: Duration) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.data_left > 0 {
            assert!(
                data.len() <= state.data_left,
                "more payload than announced: {} over {}",
                data.len(),
                state.data_left
            );
            state.data_left -= data.len();
            state.current_download.extend_from_slice(data);
            if state.data_left == 0 {
                let download = std::mem::take(&mut state.current_download);
                state.downloads.push(download);
            }
            return Ok(data.len());
        }

        let text = String::from_utf8(data.to_vec()).expect("command is not UTF-8");
        state.commands.push(text.clone());
        match state.steps.pop_front() {
            Some(Step::Command(expected)) => assert_eq!(text, expected, "unexpected command"),
            Some(Step::Download) => {
                let size = text
                    .strip_prefix("download:")
                    .unwrap_or_else(|| panic!("expected a download command, got {text:?}"));
                let size = usize::from_str_radix(size, 16).expect("bad download size");
                state.data_left = size;
                state
                    .pending_replies
                    .push_back(format!("DATA{size:08x}").into_bytes());
            }
            other => panic!("unexpected write {text:?}, script step {other:?}"),
        }
        Ok(data.len())
    }

    async fn read(&mut self, _max_len: usize, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(TransportError::Closed);
        }
        if let Some(reply) = state.pending_replies.pop_front() {
            return Ok(reply);
        }
        match state.steps.pop_front() {
            Some(Step::Reply(reply)) => Ok(reply.into_bytes()),
            Some(Step::ReadError(e)) => Err(e),
            other => panic!("unexpected read, script step {other:?}"),
        }
    }

    fn max_transfer_size(&self) -> usize {
        self.max_transfer
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}
