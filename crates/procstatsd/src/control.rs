//! Minimal line-oriented control socket standing in for the surrounding
//! service-manager integration that `spec.md` explicitly puts out of core
//! scope. Exposes the programmatic API of `spec.md` §6 so something
//! outside the process can drive state changes, trigger a write, or reset
//! the accumulator without a real host to wire it into.
//!
//! One command per line, one reply per line: `OK`, `OK <value>`, or
//! `ERR <message>`. Every command runs under the same `Mutex<GlobalState>`
//! the collection side uses, matching the single "activity lock" model of
//! `spec.md` §5 — there is never more than one mutation of `GlobalState` in
//! flight at a time.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use procstats_core::state::MemFactor;
use procstats_core::{GlobalState, Persistor};

pub fn spawn(
    socket_path: impl AsRef<Path>,
    state: Arc<Mutex<GlobalState>>,
    persistor: Arc<Persistor>,
    running: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let socket_path = socket_path.as_ref().to_path_buf();
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    listener.set_nonblocking(true)?;

    std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    let state = Arc::clone(&state);
                    let persistor = Arc::clone(&persistor);
                    std::thread::spawn(move || handle_connection(stream, state, persistor));
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }
                Err(e) => {
                    warn!(%e, "control socket accept failed");
                    break;
                }
            }
        }
        let _ = std::fs::remove_file(&socket_path);
    });
    Ok(())
}

fn handle_connection(stream: UnixStream, state: Arc<Mutex<GlobalState>>, persistor: Arc<Persistor>) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            warn!(%e, "failed to clone control socket stream");
            return;
        }
    };
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let Ok(line) = line else { break };
        let reply = dispatch(line.trim(), &state, &persistor);
        debug!(command = %line, %reply, "control command");
        if writeln!(writer, "{reply}").is_err() {
            break;
        }
    }
}

fn now_ms() -> i64 {
    crate::monotonic::now_ms()
}

/// Parses and runs one command line, returning the reply to send back.
/// Unrecognized commands and malformed arguments are reported as `ERR` per
/// `spec.md` §7's "CLI argument errors" category — no state changes.
fn dispatch(line: &str, state: &Arc<Mutex<GlobalState>>, persistor: &Arc<Persistor>) -> String {
    let mut parts = line.split_whitespace();
    let Some(cmd) = parts.next() else {
        return "ERR empty command".to_string();
    };
    let args: Vec<&str> = parts.collect();

    match cmd {
        "PING" => "OK pong".to_string(),
        "PROC_STATE" => run(|| {
            let [pkg, uid, name, state_str] = args_exact::<4>(&args)?;
            let uid: u32 = parse(uid, "uid")?;
            let now = now_ms();
            let mut gs = state.lock().unwrap();
            let proc_state = if state_str == "-" { None } else { Some(parse::<u8>(state_str, "state")?) };
            gs.set_process_state(pkg, uid, name, proc_state, now);
            Ok(None)
        }),
        "PSS" => run(|| {
            let [pkg, uid, name, pss, force] = args_exact::<5>(&args)?;
            let uid: u32 = parse(uid, "uid")?;
            let pss_kb: i64 = parse(pss, "pss_kb")?;
            let force = parse_bool(force)?;
            let now = now_ms();
            let mut gs = state.lock().unwrap();
            gs.add_pss(pkg, uid, name, pss_kb, now, force);
            Ok(None)
        }),
        "WAKE" => run(|| {
            let [pkg, uid, name] = args_exact::<3>(&args)?;
            let uid: u32 = parse(uid, "uid")?;
            let now = now_ms();
            state.lock().unwrap().report_excessive_wake(pkg, uid, name, now);
            Ok(None)
        }),
        "CPU" => run(|| {
            let [pkg, uid, name] = args_exact::<3>(&args)?;
            let uid: u32 = parse(uid, "uid")?;
            let now = now_ms();
            state.lock().unwrap().report_excessive_cpu(pkg, uid, name, now);
            Ok(None)
        }),
        "SVC_STARTED" | "SVC_BOUND" | "SVC_EXEC" => run(|| {
            let [pkg, uid, name, active, mem_factor] = args_exact::<5>(&args)?;
            let uid: u32 = parse(uid, "uid")?;
            let active = parse_bool(active)?;
            let mem_factor: u8 = parse(mem_factor, "mem_factor")?;
            let now = now_ms();
            let mut gs = state.lock().unwrap();
            let svc = gs.get_service(pkg, uid, name);
            match cmd {
                "SVC_STARTED" => svc.set_started(active, mem_factor, now),
                "SVC_BOUND" => svc.set_bound(active, mem_factor, now),
                _ => svc.set_executing(active, mem_factor, now),
            }
            Ok(None)
        }),
        "MEMFACTOR" => run(|| {
            let [factor, screen_on] = args_exact::<2>(&args)?;
            let factor: u8 = parse(factor, "factor")?;
            let factor = MemFactor::from_u8(factor).ok_or_else(|| format!("unknown mem factor {factor}"))?;
            let screen_on = parse_bool(screen_on)?;
            let now = now_ms();
            let changed = state.lock().unwrap().set_mem_factor(factor.adjusted(screen_on), now);
            Ok(Some(changed.to_string()))
        }),
        "RESET" => {
            state.lock().unwrap().reset(now_ms());
            "OK".to_string()
        }
        "WRITE_SYNC" => run(|| {
            let now = now_ms();
            let mut gs = state.lock().unwrap();
            persistor.write_sync(&mut gs, now).map_err(|e| e.to_string())?;
            Ok(None)
        }),
        "WRITE_ASYNC" => run(|| {
            let now = now_ms();
            let mut gs = state.lock().unwrap();
            persistor.commit_async(&mut gs, now).map_err(|e| e.to_string())?;
            Ok(None)
        }),
        _ => format!("ERR unknown command {cmd:?}"),
    }
}

fn run(f: impl FnOnce() -> Result<Option<String>, String>) -> String {
    match f() {
        Ok(Some(v)) => format!("OK {v}"),
        Ok(None) => "OK".to_string(),
        Err(e) => format!("ERR {e}"),
    }
}

fn args_exact<const N: usize>(args: &[&str]) -> Result<[&str; N], String> {
    <[&str; N]>::try_from(args).map_err(|_| format!("expected {N} argument(s), got {}", args.len()))
}

fn parse<T: std::str::FromStr>(s: &str, field: &str) -> Result<T, String> {
    s.parse().map_err(|_| format!("invalid {field}: {s:?}"))
}

fn parse_bool(s: &str) -> Result<bool, String> {
    match s {
        "1" | "true" => Ok(true),
        "0" | "false" => Ok(false),
        _ => Err(format!("invalid boolean: {s:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (Arc<Mutex<GlobalState>>, Arc<Persistor>) {
        let gs = Arc::new(Mutex::new(GlobalState::new(0)));
        // None of these tests exercise WRITE_SYNC/WRITE_ASYNC, so the
        // persistor never actually touches this path.
        let persistor = Arc::new(Persistor::new("/nonexistent/procstatsd-test/current.bin"));
        (gs, persistor)
    }

    #[test]
    fn ping_replies_ok() {
        let (gs, p) = fresh();
        assert_eq!(dispatch("PING", &gs, &p), "OK pong");
    }

    #[test]
    fn proc_state_then_pss_mutate_the_shared_state() {
        let (gs, p) = fresh();
        assert_eq!(dispatch("PROC_STATE com.x 1000 com.x 1", &gs, &p), "OK");
        assert_eq!(dispatch("PSS com.x 1000 com.x 12345 1", &gs, &p), "OK");
        let locked = gs.lock().unwrap();
        let id = locked.registry().packages[&("com.x".to_string(), 1000)].processes["com.x"].id();
        assert!(locked.arena()[id].pss.get(1).is_some());
    }

    #[test]
    fn unknown_command_is_reported_as_err() {
        let (gs, p) = fresh();
        assert_eq!(dispatch("DANCE", &gs, &p), "ERR unknown command \"DANCE\"");
    }

    #[test]
    fn wrong_arity_is_reported_as_err_without_mutating_state() {
        let (gs, p) = fresh();
        let reply = dispatch("PROC_STATE com.x 1000", &gs, &p);
        assert!(reply.starts_with("ERR"), "reply was {reply:?}");
        assert!(gs.lock().unwrap().arena().is_empty());
    }
}
