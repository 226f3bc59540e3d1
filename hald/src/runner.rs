// SPDX-License-Identifier: GPL-2.0

//! Supervised execution of external probe helpers and addons

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, ExitKind, Result};
use crate::eventloop::LoopMsg;
use crate::sync::Sender;

/// Exit code helpers use for "filesystem found on the main block device"
pub const HELPER_EXIT_FS_ON_MAIN_DEVICE: i32 = 2;

/// Completion record delivered to the event loop
#[derive(Debug, Clone)]
pub struct HelperDone {
	pub token: u64,
	pub udi: Option<String>,
	pub program: String,
	pub exit: ExitKind,
	pub return_code: i32,
	pub stderr: Vec<String>,
}

#[derive(Debug)]
struct CancelState {
	killed: AtomicBool,
	pid: AtomicI32,
}

#[derive(Debug)]
struct Outstanding {
	udi: Option<String>,
	program: String,
	cancel: Arc<CancelState>,
}

/// Spawns helpers, enforces deadlines, and reports completions back into
/// the event loop. Tracks outstanding helpers per device so removal can
/// cancel them.
pub struct Runner {
	tx: Sender<LoopMsg>,
	helper_dir: PathBuf,
	next_token: u64,
	outstanding: HashMap<u64, Outstanding>,
}

impl Runner {
	pub fn new(tx: Sender<LoopMsg>, helper_dir: PathBuf) -> Self {
		Self {
			tx,
			helper_dir,
			next_token: 1,
			outstanding: HashMap::new(),
		}
	}

	fn resolve_program(&self, program: &str) -> PathBuf {
		if program.contains('/') {
			PathBuf::from(program)
		} else {
			self.helper_dir.join(program)
		}
	}

	/// Spawn a helper. A timeout of None means a long-lived addon that is
	/// only reaped on death or cancellation. Returns the tracking token;
	/// completion arrives later as a HelperDone loop message.
	pub fn run(
		&mut self,
		udi: Option<&str>,
		program: &str,
		args: &[String],
		env: &[(String, String)],
		timeout: Option<Duration>,
	) -> Result<u64> {
		let token = self.next_token;
		self.next_token += 1;

		let path = self.resolve_program(program);
		let mut cmd = Command::new(&path);
		cmd.args(args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::piped());
		for (k, v) in env {
			cmd.env(k, v);
		}
		if let Some(u) = udi {
			cmd.env("UDI", u);
		}

		let child = match cmd.spawn() {
			Ok(c) => c,
			Err(e) => {
				crate::warn!("cannot execute helper {}: {}", program, e);
				return Err(Error::HelperFailed(ExitKind::Crashed));
			}
		};

		let cancel = Arc::new(CancelState {
			killed: AtomicBool::new(false),
			pid: AtomicI32::new(child.id() as i32),
		});

		self.outstanding.insert(
			token,
			Outstanding {
				udi: udi.map(|u| u.to_string()),
				program: program.to_string(),
				cancel: cancel.clone(),
			},
		);

		let tx = self.tx.clone();
		let udi_owned = udi.map(|u| u.to_string());
		let program_owned = program.to_string();
		thread::spawn(move || {
			let done = supervise(child, cancel, timeout, token, udi_owned, program_owned);
			let _ = tx.send(LoopMsg::HelperDone(done));
		});

		Ok(token)
	}

	/// Forget a completed helper. Returns its record if it was still known.
	pub fn finish(&mut self, token: u64) -> Option<(Option<String>, String)> {
		self.outstanding.remove(&token).map(|o| (o.udi, o.program))
	}

	/// Signal every outstanding helper targeting the given device. Their
	/// completion callbacks will arrive with exit-type killed.
	pub fn cancel_for_device(&mut self, udi: &str) {
		for o in self.outstanding.values() {
			if o.udi.as_deref() == Some(udi) {
				o.cancel.killed.store(true, Ordering::SeqCst);
				let pid = o.cancel.pid.load(Ordering::SeqCst);
				if pid > 0 {
					unsafe {
						libc::kill(pid, libc::SIGTERM);
					}
				}
			}
		}
	}

	/// Signal one outstanding helper by token.
	pub fn cancel(&mut self, token: u64) {
		if let Some(o) = self.outstanding.get(&token) {
			o.cancel.killed.store(true, Ordering::SeqCst);
			let pid = o.cancel.pid.load(Ordering::SeqCst);
			if pid > 0 {
				unsafe {
					libc::kill(pid, libc::SIGTERM);
				}
			}
		}
	}

	pub fn outstanding_for(&self, udi: &str) -> Vec<u64> {
		self.outstanding
			.iter()
			.filter(|(_, o)| o.udi.as_deref() == Some(udi))
			.map(|(t, _)| *t)
			.collect()
	}

	pub fn outstanding_len(&self) -> usize {
		self.outstanding.len()
	}
}

fn read_stderr_lines(child: &mut Child) -> Vec<String> {
	let mut buf = String::new();
	if let Some(mut stderr) = child.stderr.take() {
		let _ = stderr.read_to_string(&mut buf);
	}
	buf.lines().map(|l| l.to_string()).collect()
}

fn supervise(
	mut child: Child,
	cancel: Arc<CancelState>,
	timeout: Option<Duration>,
	token: u64,
	udi: Option<String>,
	program: String,
) -> HelperDone {
	let deadline = timeout.map(|t| Instant::now() + t);
	let mut exit = ExitKind::Normal;

	let status = loop {
		if cancel.killed.load(Ordering::SeqCst) {
			exit = ExitKind::Killed;
			let _ = child.kill();
			break child.wait().ok();
		}
		match child.try_wait() {
			Ok(Some(status)) => break Some(status),
			Ok(None) => {
				if let Some(d) = deadline {
					if Instant::now() >= d {
						exit = ExitKind::Timeout;
						let _ = child.kill();
						break child.wait().ok();
					}
				}
				thread::sleep(Duration::from_millis(50));
			}
			Err(_) => {
				exit = ExitKind::Crashed;
				break None;
			}
		}
	};

	let stderr = read_stderr_lines(&mut child);
	let return_code = match status {
		Some(s) => match s.code() {
			Some(code) => code,
			None => {
				// terminated by a signal we did not send
				if exit == ExitKind::Normal {
					exit = ExitKind::Crashed;
				}
				-1
			}
		},
		None => -1,
	};

	HelperDone {
		token,
		udi,
		program,
		exit,
		return_code,
		stderr,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sync::channel;

	fn recv_done(rx: &std::sync::mpsc::Receiver<LoopMsg>) -> HelperDone {
		match rx.recv_timeout(Duration::from_secs(5)).expect("helper completion") {
			LoopMsg::HelperDone(done) => done,
			other => panic!("unexpected loop message {:?}", other),
		}
	}

	#[test]
	fn successful_helper_reports_normal_exit() {
		let (tx, rx) = channel();
		let mut runner = Runner::new(tx, PathBuf::from("/"));
		runner
			.run(Some("/d"), "/bin/sh", &["-c".into(), "exit 0".into()], &[], Some(Duration::from_secs(5)))
			.unwrap();
		let done = recv_done(&rx);
		assert_eq!(done.exit, ExitKind::Normal);
		assert_eq!(done.return_code, 0);
		assert_eq!(done.udi.as_deref(), Some("/d"));
	}

	#[test]
	fn nonzero_exit_code_is_reported() {
		let (tx, rx) = channel();
		let mut runner = Runner::new(tx, PathBuf::from("/"));
		runner
			.run(None, "/bin/sh", &["-c".into(), "exit 2".into()], &[], Some(Duration::from_secs(5)))
			.unwrap();
		let done = recv_done(&rx);
		assert_eq!(done.exit, ExitKind::Normal);
		assert_eq!(done.return_code, HELPER_EXIT_FS_ON_MAIN_DEVICE);
	}

	#[test]
	fn deadline_kills_slow_helper() {
		let (tx, rx) = channel();
		let mut runner = Runner::new(tx, PathBuf::from("/"));
		runner
			.run(None, "/bin/sh", &["-c".into(), "sleep 30".into()], &[], Some(Duration::from_millis(200)))
			.unwrap();
		let done = recv_done(&rx);
		assert_eq!(done.exit, ExitKind::Timeout);
	}

	#[test]
	fn cancel_for_device_kills_outstanding_helpers() {
		let (tx, rx) = channel();
		let mut runner = Runner::new(tx, PathBuf::from("/"));
		let token = runner
			.run(Some("/d"), "/bin/sh", &["-c".into(), "sleep 30".into()], &[], None)
			.unwrap();
		assert_eq!(runner.outstanding_for("/d"), vec![token]);
		runner.cancel_for_device("/d");
		let done = recv_done(&rx);
		assert_eq!(done.exit, ExitKind::Killed);
		runner.finish(done.token);
		assert_eq!(runner.outstanding_len(), 0);
	}

	#[test]
	fn stderr_lines_are_captured() {
		let (tx, rx) = channel();
		let mut runner = Runner::new(tx, PathBuf::from("/"));
		runner
			.run(None, "/bin/sh", &["-c".into(), "echo oops >&2; exit 1".into()], &[], Some(Duration::from_secs(5)))
			.unwrap();
		let done = recv_done(&rx);
		assert_eq!(done.return_code, 1);
		assert_eq!(done.stderr, vec!["oops".to_string()]);
	}

	#[test]
	fn missing_program_fails_to_spawn() {
		let (tx, _rx) = channel();
		let mut runner = Runner::new(tx, PathBuf::from("/nonexistent"));
		let err = runner.run(None, "no-such-helper", &[], &[], Some(Duration::from_secs(1)));
		assert_eq!(err, Err(Error::HelperFailed(ExitKind::Crashed)));
	}
}
