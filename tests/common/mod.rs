//! Shared test fixtures: an in-process sentry stand-in speaking the
//! control protocol, plus a scripted process reaper.

use std::collections::HashSet;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use wardenrun::error::Result;
use wardenrun::process::ProcessReaper;
use wardenrun::sandbox::rpc::{
    ErrorPayload, OkPayload, Request, Response, ResponseData, RpcErrorCode,
};
use wardenrun::sandbox::RuntimeState;

// =============================================================================
// Fake Sentry
// =============================================================================

#[derive(Default)]
struct SentryState {
    paused: bool,
    wait_status: i32,
    runtime_state: Option<RuntimeState>,
    methods: Vec<String>,
}

/// Accepts control connections on a unix socket and answers every
/// request the way a healthy sentry would, with scriptable wait
/// status, runtime state, and pause behavior.
pub struct FakeSentry {
    state: Arc<Mutex<SentryState>>,
    stop: Arc<AtomicBool>,
    endpoint: PathBuf,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl FakeSentry {
    pub fn start(endpoint: &Path) -> FakeSentry {
        let _ = std::fs::remove_file(endpoint);
        if let Some(parent) = endpoint.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let listener = UnixListener::bind(endpoint).unwrap();
        listener.set_nonblocking(true).unwrap();

        let state = Arc::new(Mutex::new(SentryState {
            wait_status: 0,
            ..Default::default()
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let thread_state = Arc::clone(&state);
        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::spawn(move || loop {
            match listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false).unwrap();
                    serve_connection(stream, &thread_state);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if thread_stop.load(Ordering::SeqCst) {
                        return;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(_) => return,
            }
        });

        FakeSentry {
            state,
            stop,
            endpoint: endpoint.to_path_buf(),
            thread: Some(thread),
        }
    }

    pub fn set_wait_status(&self, status: i32) {
        self.state.lock().unwrap().wait_status = status;
    }

    pub fn set_runtime_state(&self, state: RuntimeState) {
        self.state.lock().unwrap().runtime_state = Some(state);
    }

    /// Method names of every request received so far.
    pub fn methods(&self) -> Vec<String> {
        self.state.lock().unwrap().methods.clone()
    }
}

impl Drop for FakeSentry {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        let _ = std::fs::remove_file(&self.endpoint);
    }
}

fn serve_connection(stream: std::os::unix::net::UnixStream, state: &Arc<Mutex<SentryState>>) {
    let mut writer = stream.try_clone().unwrap();
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { return };
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => respond(&request, state),
            Err(e) => Response::Error(ErrorPayload {
                code: RpcErrorCode::Internal,
                message: format!("bad request: {e}"),
            }),
        };
        let mut payload = serde_json::to_vec(&response).unwrap();
        payload.push(b'\n');
        if writer.write_all(&payload).is_err() {
            return;
        }
    }
}

fn respond(request: &Request, state: &Arc<Mutex<SentryState>>) -> Response {
    let mut state = state.lock().unwrap();
    let method = serde_json::to_value(request).unwrap()["method"]
        .as_str()
        .unwrap()
        .to_string();
    state.methods.push(method);

    let ok = |data: Option<ResponseData>| Response::Ok(OkPayload { data });
    match request {
        Request::Wait { .. } | Request::WaitPid { .. } | Request::WaitRootPid { .. } => {
            ok(Some(ResponseData::WaitStatus {
                status: state.wait_status,
            }))
        }
        Request::Execute { .. } => ok(Some(ResponseData::Pid { pid: 123 })),
        Request::RuntimeState { .. } => ok(Some(ResponseData::RuntimeState {
            state: state.runtime_state.unwrap_or(RuntimeState::Running),
        })),
        Request::Processes { .. } => ok(Some(ResponseData::Processes {
            processes: vec![wardenrun::sandbox::ProcessInfo {
                pid: 1,
                cmd: "sleep".into(),
                uid: 0,
            }],
        })),
        Request::Event { cid } => {
            let mut event = wardenrun::sandbox::EventOut::default();
            event.event.typ = "stats".into();
            event.event.id = cid.clone();
            ok(Some(ResponseData::Event { event }))
        }
        Request::Pause { .. } => {
            state.paused = true;
            ok(None)
        }
        Request::Resume { .. } => {
            state.paused = false;
            ok(None)
        }
        Request::SignalContainer { all, .. } if state.paused && !all => {
            Response::Error(ErrorPayload {
                code: RpcErrorCode::InvalidState,
                message: "container is paused".into(),
            })
        }
        _ => ok(None),
    }
}

// =============================================================================
// Fake Reaper
// =============================================================================

/// Reaper whose process table is scripted by the test.
#[derive(Default)]
pub struct FakeReaper {
    pub alive: Mutex<HashSet<i32>>,
}

impl ProcessReaper for FakeReaper {
    fn kill(&self, pid: i32, signo: i32) -> Result<()> {
        if signo == libc::SIGKILL {
            self.alive.lock().unwrap().remove(&pid);
        }
        Ok(())
    }

    fn alive(&self, pid: i32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn reap(&self, pid: i32) -> Result<()> {
        self.alive.lock().unwrap().remove(&pid);
        Ok(())
    }
}
