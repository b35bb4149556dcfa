//! Test utilities & fixtures.
//! Every test gets its own data directory and fast supervisor timings.

use std::path::Path;
use std::time::Duration;

use meshbadge::badge::Running;
use meshbadge::config::Config;
use meshbadge::pipeline::FeedUpdate;
use meshbadge::supervisor::LinkState;

/// Defaults with storage under `dir`, millisecond backoff and no log file.
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.to_string_lossy().into_owned();
    config.supervisor.backoff_base_ms = 10;
    config.supervisor.backoff_cap_ms = 50;
    config.supervisor.probe_interval_ms = 60_000;
    config.pipeline.drain_timeout_ms = 500;
    config.feed.viewport_height = 5;
    config.logging.file = None;
    config
}

/// Wait until the supervisor reports a live link.
#[allow(dead_code)]
pub async fn wait_connected(running: &Running) {
    let mut status = running.link().subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if status.borrow_and_update().state == LinkState::Connected {
                return;
            }
            if status.changed().await.is_err() {
                panic!("supervisor stopped before connecting");
            }
        }
    })
    .await
    .expect("link did not come up");
}

/// Next feed update that is not a notice.
#[allow(dead_code)]
pub async fn next_feed_change(running: &mut Running) -> FeedUpdate {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match running.next_update().await {
                Some(FeedUpdate::Notice(_)) => continue,
                Some(update) => return update,
                None => panic!("feed channel closed"),
            }
        }
    })
    .await
    .expect("no feed update")
}
