// SPDX-License-Identifier: Apache-2.0

//! The tailing source lifecycle.
//!
//! The host drives `configure → start → process* → stop`. Each `process`
//! call refreshes the matchers, reconciles the registry, and drains dirty
//! files in `(last_updated, identity)` order, handing records to the channel
//! in transactions of up to `batchSize`. Offsets promote only after a commit;
//! a failed transaction rolls back, rewinds the read cursor, and ends the
//! cycle with [`Status::Backoff`].
//!
//! Two background threads share the registry mutex: an idle-checker that
//! closes handles for files untouched past `idleTimeout`, and a position
//! writer that rewrites the snapshot every `writePosInterval` seconds in
//! addition to the post-commit writes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::channel::{Channel, Transaction};
use crate::config::{Context, TaildirConfig};
use crate::error::{Error, Result};
use crate::file_id::FileId;
use crate::matcher::TaildirMatcher;
use crate::position::PositionStore;
use crate::registry::FileRegistry;
use crate::tail_file::Multiline;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL: Duration = Duration::from_millis(250);

/// Outcome of one `process` cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Records were produced this cycle
    Ready,
    /// Nothing to do, or the cycle was cut short; the host should retry
    /// with a delay
    Backoff,
}

struct Group {
    matcher: TaildirMatcher,
    headers: Arc<HashMap<String, String>>,
}

struct Running {
    groups: Vec<Group>,
    registry: Arc<Mutex<FileRegistry>>,
    store: Arc<PositionStore>,
    positions: HashMap<FileId, (u64, PathBuf)>,
    shutdown: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

/// A tailing file source bound to a downstream channel.
pub struct TaildirSource<C: Channel> {
    channel: C,
    config: Option<TaildirConfig>,
    running: Option<Running>,
}

impl<C: Channel> TaildirSource<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            config: None,
            running: None,
        }
    }

    /// Validate the host-supplied context. Pattern and multiline regex
    /// compilation happen here so a bad configuration never reaches `start`.
    pub fn configure(&mut self, ctx: &Context) -> Result<()> {
        let config = TaildirConfig::from_context(ctx)?;
        Self::build_groups(&config)?;
        if let Some(ref ml) = config.multiline {
            Multiline::from_config(ml)?;
        }
        self.config = Some(config);
        Ok(())
    }

    fn build_groups(config: &TaildirConfig) -> Result<Vec<Group>> {
        config
            .groups
            .iter()
            .map(|g| {
                Ok(Group {
                    matcher: TaildirMatcher::new(
                        g.name.clone(),
                        &g.pattern,
                        config.cache_pattern_matching,
                    )?,
                    headers: Arc::new(g.headers.clone()),
                })
            })
            .collect()
    }

    pub fn start(&mut self) -> Result<()> {
        let config = self
            .config
            .clone()
            .ok_or_else(|| Error::Config("configure must be called before start".to_string()))?;
        if self.running.is_some() {
            return Err(Error::Config("source is already started".to_string()));
        }

        let groups = Self::build_groups(&config)?;
        let multiline = match config.multiline {
            Some(ref ml) => Some(Multiline::from_config(ml)?),
            None => None,
        };

        let store = Arc::new(PositionStore::new(&config.position_file));
        let positions = store.load();
        let registry = Arc::new(Mutex::new(FileRegistry::new(
            config.skip_to_end,
            config.idle_timeout_secs,
            config.max_open_files,
            multiline,
        )));
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::new();
        workers.push(spawn_worker(
            "taildir-idle",
            IDLE_CHECK_INTERVAL,
            shutdown.clone(),
            {
                let registry = registry.clone();
                move || {
                    if let Ok(mut reg) = registry.lock() {
                        reg.close_idle();
                    }
                }
            },
        )?);
        if config.write_pos_interval_secs > 0 {
            workers.push(spawn_worker(
                "taildir-pos-writer",
                Duration::from_secs(config.write_pos_interval_secs),
                shutdown.clone(),
                {
                    let registry = registry.clone();
                    let store = store.clone();
                    move || {
                        let entries = match registry.lock() {
                            Ok(reg) => reg.position_entries(),
                            Err(_) => return,
                        };
                        if let Err(e) = store.write(entries) {
                            error!(error = %e, "Failed to write position file");
                        }
                    }
                },
            )?);
        }

        info!(
            position_file = %config.position_file.display(),
            groups = config.groups.len(),
            "Taildir source started"
        );

        self.running = Some(Running {
            groups,
            registry,
            store,
            positions,
            shutdown,
            workers,
        });
        Ok(())
    }

    /// One poll cycle. Returns [`Status::Ready`] when at least one record was
    /// committed to the channel.
    pub fn process(&mut self) -> Result<Status> {
        let Self {
            channel,
            config,
            running,
        } = self;
        let running = running.as_mut().ok_or(Error::NotRunning)?;
        let config = config.as_ref().ok_or(Error::NotRunning)?;

        let mut matched = Vec::new();
        for group in &mut running.groups {
            for path in group.matcher.matching_files() {
                matched.push((path, group.headers.clone()));
            }
        }

        let mut registry = running
            .registry
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        registry.reconcile(&matched, &running.positions);

        let mut produced = 0usize;
        for id in registry.consume_order() {
            let dirty = match registry.get_mut(id) {
                Some(tf) => tf.need_tail() || tf.need_flush_buffer_event(),
                None => false,
            };
            if !dirty {
                continue;
            }

            match tail_file_process(&mut registry, id, config, channel, &running.store) {
                Ok(count) => produced += count,
                Err(Error::Channel(e)) => {
                    warn!(error = %e, "Channel rejected batch, backing off");
                    return Ok(Status::Backoff);
                }
                Err(Error::Io(e)) => {
                    if let Some(tf) = registry.get_mut(id) {
                        warn!(path = %tf.path().display(), inode = %id, error = %e, "Failed reading file, skipping this cycle");
                        tf.set_need_tail(false);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(if produced > 0 {
            Status::Ready
        } else {
            Status::Backoff
        })
    }

    /// Stop the workers, write a final snapshot, and close every handle.
    pub fn stop(&mut self) -> Result<()> {
        let mut running = self.running.take().ok_or(Error::NotRunning)?;
        running.shutdown.store(true, Ordering::Relaxed);
        for worker in running.workers.drain(..) {
            if worker.join().is_err() {
                warn!("Background worker panicked during shutdown");
            }
        }

        let mut registry = running
            .registry
            .lock()
            .map_err(|e| Error::Persistence(e.to_string()))?;
        if let Err(e) = running.store.write(registry.position_entries()) {
            error!(error = %e, "Failed to write final position file");
        }
        registry.close_all();

        info!("Taildir source stopped");
        Ok(())
    }

    /// The downstream channel this source delivers to
    pub fn channel(&self) -> &C {
        &self.channel
    }
}

/// Drain one file: repeat transactions of up to `batchSize` records until a
/// short batch. Returns the number of committed records.
fn tail_file_process<C: Channel>(
    registry: &mut FileRegistry,
    id: FileId,
    config: &TaildirConfig,
    channel: &C,
    store: &PositionStore,
) -> Result<usize> {
    let mut total = 0usize;
    loop {
        let (events, path, group_headers) = {
            let Some(tf) = registry.get_mut(id) else {
                break;
            };
            let events = tf.read_events(
                config.batch_size,
                config.backoff_without_nl,
                config.byte_offset_header,
            )?;
            if events.is_empty() {
                tf.set_need_tail(false);
                break;
            }
            (events, tf.path().to_path_buf(), tf.headers().clone())
        };
        let count = events.len();
        let path_str = path.display().to_string();

        let mut txn = channel.transaction();
        txn.begin();
        let mut staged = Ok(());
        for mut event in events {
            if config.file_header {
                event.set_header(config.file_header_key.clone(), path_str.clone());
            }
            event.add_headers(&group_headers);
            if let Err(e) = txn.put(event) {
                staged = Err(e);
                break;
            }
        }

        match staged.and_then(|_| txn.commit()) {
            Ok(()) => {
                txn.close();
                if let Some(tf) = registry.get_mut(id) {
                    let cursor = tf.line_read_pos();
                    tf.update_pos(&path, id, cursor)?;
                }
                registry.mark_read(id);
                total += count;
                if let Err(e) = store.write(registry.position_entries()) {
                    error!(error = %e, "Failed to write position file after commit");
                }
                if count < config.batch_size {
                    break;
                }
            }
            Err(e) => {
                txn.rollback();
                txn.close();
                if let Some(tf) = registry.get_mut(id) {
                    let pos = tf.pos();
                    tf.clear_buffer_event();
                    tf.update_file_pos(pos)?;
                }
                return Err(Error::Channel(e.to_string()));
            }
        }
    }
    Ok(total)
}

fn spawn_worker(
    name: &str,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    mut work: impl FnMut() + Send + 'static,
) -> Result<JoinHandle<()>> {
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut elapsed = Duration::ZERO;
            while !shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(SHUTDOWN_POLL);
                elapsed += SHUTDOWN_POLL;
                if elapsed >= interval {
                    elapsed = Duration::ZERO;
                    work();
                }
            }
        })?;
    Ok(handle)
}
