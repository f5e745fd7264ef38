//! Purpose: Hold top-level CLI command dispatch for `keyplane`.
//! Exports: `dispatch_command`, `split_selector`.
//! Role: Keep `main.rs` focused on parse/bootstrap and delegate command execution.
//! Invariants: Each command owns one session and closes it before returning.
//! Invariants: Long-running commands poll the stop flag and return `RunOutcome::ok()` on signal.

use super::*;
use keyplane::api::{
    Attachment, FullPolicy, GetOptions, PublicationOptions, PutOptions, Query, ReplyOptions,
    Session, TryRecv, bounded, reply_channel,
};
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub(super) fn dispatch_command(
    command: Command,
    config: Config,
    color_mode: ColorMode,
) -> Result<RunOutcome, Error> {
    match command {
        Command::Put {
            key,
            value,
            peer,
            attach,
        } => {
            let attachment = parse_attachment(&attach)?;
            let session = Session::open(with_peer(config, peer)?)?;
            let id = session.declare_keyexpr(&key)?;
            let publication = session.declare_publication(id, PublicationOptions::default())?;
            let matching = publication.matching_status()?.matching;
            publication.put(
                value.clone(),
                PutOptions {
                    attachment,
                    ..PutOptions::default()
                },
            )?;
            emit_json(json!({
                "cmd": "put",
                "key_expr": key,
                "expr_id": id.get(),
                "value": value,
                "matching": matching,
                "time": format_time(SystemTime::now()),
            }));
            publication.undeclare()?;
            session.undeclare_keyexpr(id)?;
            session.close()?;
            Ok(RunOutcome::ok())
        }
        Command::Pub {
            key,
            value,
            peer,
            interval_ms,
            count,
        } => {
            let stop = install_stop_flag()?;
            let session = Session::open(with_peer(config, peer)?)?;
            let id = session.declare_keyexpr(&key)?;
            let publication = session.declare_publication(id, PublicationOptions::default())?;
            let interval = Duration::from_millis(interval_ms);
            let mut idx: u64 = 0;
            while count.is_none_or(|limit| idx < limit) {
                if !sleep_unless_stopped(interval, &stop) {
                    break;
                }
                let payload = format!("[{idx:4}] {value}");
                publication.put(payload.clone(), PutOptions::default())?;
                emit_json(json!({
                    "cmd": "pub",
                    "seq": idx,
                    "key_expr": key,
                    "expr_id": id.get(),
                    "payload": payload,
                    "time": format_time(SystemTime::now()),
                }));
                idx += 1;
            }
            tracing::info!(puts = idx, "publisher stopping");
            publication.undeclare()?;
            session.undeclare_keyexpr(id)?;
            session.close()?;
            Ok(RunOutcome::ok())
        }
        Command::Sub { key, peer, count } => {
            let stop = install_stop_flag()?;
            let config = with_peer(config, peer)?;
            let (sender, receiver) = bounded::<Sample>(config.queue_depth(), FullPolicy::Fail)?;
            let session = Session::open(config)?;
            let subscriber = session.declare_subscriber(&key, sender)?;
            let mut seen: u64 = 0;
            while !stopped(&stop) && count.is_none_or(|limit| seen < limit) {
                match receiver.recv_timeout(POLL_INTERVAL) {
                    TryRecv::Item(sample) => {
                        emit_json(sample_json(&sample));
                        seen += 1;
                    }
                    TryRecv::Empty => {}
                    TryRecv::Closed => break,
                }
            }
            subscriber.undeclare()?;
            session.close()?;
            Ok(RunOutcome::ok())
        }
        Command::Get {
            selector,
            peer,
            timeout_ms,
        } => {
            let (key, parameters) = split_selector(&selector);
            let config = with_peer(config, peer)?;
            let (sender, receiver) =
                reply_channel(config.reply_capacity(), config.reply_full_policy())?;
            let session = Session::open(config)?;
            session.get_with_channel(
                key,
                parameters,
                GetOptions {
                    timeout: timeout_ms.map(Duration::from_millis),
                    ..GetOptions::default()
                },
                sender,
            )?;
            for reply in receiver {
                emit_json(reply_json(&reply));
            }
            session.close()?;
            Ok(RunOutcome::ok())
        }
        Command::Queryable { key, value, peer } => {
            let stop = install_stop_flag()?;
            let session = Session::open(with_peer(config, peer)?)?;
            let reply_key = key.clone();
            let queryable = session.declare_queryable(&key, move |query: Query| {
                emit_json(json!({
                    "cmd": "queryable",
                    "key_expr": query.key_expr().as_str(),
                    "parameters": query.parameters(),
                    "time": format_time(SystemTime::now()),
                }));
                if let Err(err) = query.reply(&reply_key, value.clone(), ReplyOptions::default()) {
                    emit_error(&err, color_mode);
                }
            })?;
            while sleep_unless_stopped(POLL_INTERVAL, &stop) {}
            queryable.undeclare()?;
            session.close()?;
            Ok(RunOutcome::ok())
        }
    }
}

/// `key?parameters`; everything after the first `?` is parameters.
pub(super) fn split_selector(selector: &str) -> (&str, &str) {
    selector.split_once('?').unwrap_or((selector, ""))
}

fn parse_attachment(pairs: &[String]) -> Result<Option<Attachment>, Error> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut parsed = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(Error::new(ErrorKind::Usage)
                .with_message(format!("attachment '{pair}' is not KEY=VALUE"))
                .with_hint("Use --attach key=value (repeatable)."));
        };
        parsed.push((key, value));
    }
    Ok(Some(Attachment::encode(parsed)))
}

/// Returns `false` as soon as a stop signal is observed.
fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) -> bool {
    let mut remaining = duration;
    while !remaining.is_zero() {
        if stopped(stop) {
            return false;
        }
        let step = remaining.min(POLL_INTERVAL);
        thread::sleep(step);
        remaining -= step;
    }
    !stopped(stop)
}
