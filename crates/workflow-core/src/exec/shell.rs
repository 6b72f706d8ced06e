//! Synchronous shell-command execution for server-context steps (§4.4).
//!
//! Deliberately not `tokio::process`: the executor core is a plain
//! synchronous state machine, so a blocking `std::process::Command` plus a
//! poll loop keeps the child handle on the calling thread for its whole
//! lifetime, which lets a timeout `kill()` it directly. stdout/stderr are
//! drained on dedicated reader threads so a chatty child can't deadlock on a
//! full pipe buffer while the poll loop sleeps.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{EngineError, Result};
use crate::value::Value;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub fn run(command: &str, args: &[String], timeout: Duration) -> Result<Value> {
    let mut child = Command::new(command)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let stdout_buf = Arc::new(Mutex::new(Vec::new()));
    let stderr_buf = Arc::new(Mutex::new(Vec::new()));
    let stdout_reader = spawn_reader(stdout, Arc::clone(&stdout_buf));
    let stderr_reader = spawn_reader(stderr, Arc::clone(&stderr_buf));

    let start = Instant::now();
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_reader.join();
            let _ = stderr_reader.join();
            return Err(EngineError::Timeout(timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    let _ = stdout_reader.join();
    let _ = stderr_reader.join();

    let stdout_text = String::from_utf8_lossy(&stdout_buf.lock().expect("reader thread poisoned")).into_owned();
    let stderr_text = String::from_utf8_lossy(&stderr_buf.lock().expect("reader thread poisoned")).into_owned();
    let exit_code = status.code().unwrap_or(-1);

    if exit_code != 0 {
        return Err(EngineError::Tool(format!(
            "command '{command}' exited with status {exit_code}: {stderr_text}"
        )));
    }

    Ok(Value::object(
        [
            ("stdout".to_string(), Value::string(stdout_text)),
            ("stderr".to_string(), Value::string(stderr_text)),
            ("exit_code".to_string(), Value::number(exit_code as f64)),
        ]
        .into_iter()
        .collect(),
    ))
}

fn spawn_reader<R: Read + Send + 'static>(mut reader: R, buf: Arc<Mutex<Vec<u8>>>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => buf.lock().expect("reader thread poisoned").extend_from_slice(&chunk[..n]),
            }
        }
    })
}
