//! CLI Integration Tests
//!
//! Runs the `imrpc` binary: argument validation, then a real `serve` /
//! `call` round trip on a loopback port.

use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

fn imrpc() -> Command {
    Command::new(env!("CARGO_BIN_EXE_imrpc"))
}

/// Reserves a free loopback port by binding and releasing it.
fn free_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

struct Serving(Child);

impl Drop for Serving {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn serve(addr: &str) -> Serving {
    let child = imrpc()
        .args(["serve", "-b", addr])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    Serving(child)
}

/// Calls until the server answers or two seconds pass.
fn call_when_ready(args: &[&str]) -> std::process::Output {
    let mut last = None;
    for _ in 0..40 {
        let output = imrpc().args(args).output().unwrap();
        if output.status.success() {
            return output;
        }
        last = Some(output);
        std::thread::sleep(Duration::from_millis(50));
    }
    last.unwrap()
}

#[test]
fn test_help_flag() {
    let output = imrpc().arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("serve"));
    assert!(stdout.contains("call"));
}

#[test]
fn test_call_with_invalid_json_args() {
    let output = imrpc()
        .args(["call", "Echo", "Echo", "-a", "127.0.0.1:1", "--args", "{not json"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Invalid JSON"));
}

#[test]
fn test_call_without_address() {
    let output = imrpc().args(["call", "Echo", "Echo"]).output().unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_call_connection_refused() {
    let addr = free_addr();
    let output = imrpc()
        .args(["call", "Echo", "Echo", "-a", &addr, "--timeout-ms", "2000"])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_serve_and_call() {
    let addr = free_addr();
    let _server = serve(&addr);

    let output = call_when_ready(&["call", "Echo", "Echo", "-a", &addr, "--args", r#"{"a":1}"#]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), r#"{"a":1}"#);

    let output = imrpc()
        .args(["call", "Echo", "Echo", "-a", &addr, "--args", "[1,2,3]", "--compress", "gzip"])
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "[1,2,3]");

    let output = imrpc()
        .args(["call", "Echo", "Fail", "-a", &addr, "--args", r#""broken""#])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("broken"));
}

#[test]
fn test_serve_deadline_and_oneway() {
    let addr = free_addr();
    let _server = serve(&addr);
    call_when_ready(&["call", "Echo", "Stats", "-a", &addr]);

    let output = imrpc()
        .args(["call", "Echo", "Sleep", "-a", &addr, "--args", "3000", "--timeout-ms", "200"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("Deadline exceeded"));

    let output = imrpc()
        .args(["call", "Echo", "Count", "-a", &addr, "--oneway"])
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(output.stdout.is_empty());

    std::thread::sleep(Duration::from_millis(200));
    let output = imrpc()
        .args(["call", "Echo", "Stats", "-a", &addr])
        .output()
        .unwrap();
    assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "1");
}
