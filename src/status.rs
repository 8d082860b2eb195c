// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Live pool statistics rendered for monitoring tools.
//!
//! The JSON field set and the plain-text line order are part of the wire
//! contract; changing either breaks dashboards.

use crate::pool::WorkerPool;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// A self-consistent snapshot of one pool's statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    /// Pool name
    pub pool: String,
    /// Scheduling policy name
    #[serde(rename = "process-manager")]
    pub process_manager: String,
    /// Pool start time
    #[serde(rename = "start-time")]
    pub start_time: DateTime<Utc>,
    /// Seconds since start
    #[serde(rename = "start-since")]
    pub start_since: i64,
    /// Total accepted requests
    #[serde(rename = "accepted-conn")]
    pub accepted_conn: u64,
    /// Requests accepted but not yet assigned to a worker
    #[serde(rename = "listen-queue")]
    pub listen_queue: u64,
    /// High-water mark of the listen queue
    #[serde(rename = "max-listen-queue")]
    pub max_listen_queue: u64,
    /// Configured socket backlog
    #[serde(rename = "listen-queue-len")]
    pub listen_queue_len: u32,
    /// Workers currently idle
    #[serde(rename = "idle-processes")]
    pub idle_processes: u64,
    /// Workers currently busy
    #[serde(rename = "active-processes")]
    pub active_processes: u64,
    /// Workers in the pool
    #[serde(rename = "total-processes")]
    pub total_processes: u64,
    /// High-water mark of concurrently busy workers
    #[serde(rename = "max-active-processes")]
    pub max_active_processes: u64,
    /// Times a request found the pool at its limit
    #[serde(rename = "max-children-reached")]
    pub max_children_reached: u64,
    /// Requests that hit the terminate deadline
    #[serde(rename = "slow-requests")]
    pub slow_requests: u64,
}

impl StatusSnapshot {
    /// Captures the pool's statistics.
    pub fn capture(pool: &WorkerPool) -> Self {
        let stats = pool.stats();
        let now = Utc::now();
        Self {
            pool: pool.config().name.clone(),
            process_manager: pool.config().pm.to_string(),
            start_time: stats.start_time,
            start_since: (now - stats.start_time).num_seconds(),
            accepted_conn: stats.accepted_conn,
            listen_queue: stats.listen_queue,
            max_listen_queue: stats.max_listen_queue,
            listen_queue_len: pool.config().listen_backlog,
            idle_processes: stats.idle_processes,
            active_processes: stats.active_processes,
            total_processes: stats.total_processes,
            max_active_processes: stats.max_active_processes,
            max_children_reached: stats.max_children_reached,
            slow_requests: stats.slow_requests,
        }
    }

    /// Renders the snapshot as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Renders the snapshot as the fixed-form plain-text block.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let mut line = |label: &str, value: String| {
            out.push_str(&format!("{:<22} {}\n", format!("{label}:"), value));
        };
        line("pool", self.pool.clone());
        line("process manager", self.process_manager.clone());
        line(
            "start time",
            self.start_time.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        line("start since", self.start_since.to_string());
        line("accepted conn", self.accepted_conn.to_string());
        line("listen queue", self.listen_queue.to_string());
        line("max listen queue", self.max_listen_queue.to_string());
        line("listen queue len", self.listen_queue_len.to_string());
        line("idle processes", self.idle_processes.to_string());
        line("active processes", self.active_processes.to_string());
        line("total processes", self.total_processes.to_string());
        line("max active processes", self.max_active_processes.to_string());
        line("max children reached", self.max_children_reached.to_string());
        line("slow requests", self.slow_requests.to_string());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> StatusSnapshot {
        StatusSnapshot {
            pool: "www".to_owned(),
            process_manager: "dynamic".to_owned(),
            start_time: Utc::now(),
            start_since: 42,
            accepted_conn: 100,
            listen_queue: 0,
            max_listen_queue: 3,
            listen_queue_len: 511,
            idle_processes: 2,
            active_processes: 1,
            total_processes: 3,
            max_active_processes: 4,
            max_children_reached: 0,
            slow_requests: 1,
        }
    }

    #[test]
    fn json_field_set_is_exact() {
        let json = snapshot().to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let object = value.as_object().unwrap();

        let expected = [
            "pool",
            "process-manager",
            "start-time",
            "start-since",
            "accepted-conn",
            "listen-queue",
            "max-listen-queue",
            "listen-queue-len",
            "idle-processes",
            "active-processes",
            "total-processes",
            "max-active-processes",
            "max-children-reached",
            "slow-requests",
        ];
        for field in expected {
            assert!(object.contains_key(field), "missing `{field}`");
        }
        assert_eq!(object.len(), expected.len());
        assert_eq!(object["accepted-conn"], 100);
        assert_eq!(object["process-manager"], "dynamic");
    }

    #[test]
    fn text_block_order() {
        let text = snapshot().to_text();
        let labels: Vec<&str> = text
            .lines()
            .map(|l| l.split(':').next().unwrap().trim_end())
            .collect();
        assert_eq!(
            labels,
            [
                "pool",
                "process manager",
                "start time",
                "start since",
                "accepted conn",
                "listen queue",
                "max listen queue",
                "listen queue len",
                "idle processes",
                "active processes",
                "total processes",
                "max active processes",
                "max children reached",
                "slow requests",
            ]
        );
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("pool:"));
        assert!(first.ends_with(" www"));
    }
}
