/*
 * Description: Cpu and memory rate limiters gating the compression pipeline.
 *
 * Copyright (C) 2025 the soong-zip project developers
 * SPDX-License-Identifier: Apache-2.0
 *
 * Licensed under the Apache License, Version 2.0 (see LICENSE).
 */

//! Cpu and memory rate limiters gating the compression pipeline.
//!
//! Both limiters are thin wrappers over one [`RateLimit`], a counting gate
//! with strict first-come, first-served admission. Every `request` has a
//! matching `finish`; a quota of zero admits everything immediately but still
//! tracks the outstanding total so that symmetry is preserved.

use tokio::{
  sync::{mpsc, oneshot},
  task,
};

use std::collections::VecDeque;

/// A counting resource gate. Requests are granted in arrival order by a
/// monitor task that owns all of the accounting state; the handle side only
/// ever touches channels.
#[derive(Clone)]
pub struct RateLimit {
  request_tx: mpsc::Sender<(u64, oneshot::Sender<()>)>,
  finish_tx: mpsc::UnboundedSender<u64>,
}

impl RateLimit {
  /// A `quota` of zero disables blocking entirely.
  pub fn new(quota: u64) -> Self {
    let (request_tx, request_rx) = mpsc::channel(16);
    let (finish_tx, finish_rx) = mpsc::unbounded_channel();
    task::spawn(Self::monitor(quota, request_rx, finish_rx));
    Self {
      request_tx,
      finish_tx,
    }
  }

  /// Block until `n` units fit under the quota, then claim them.
  pub async fn request(&self, n: u64) {
    let (granted_tx, granted_rx) = oneshot::channel();
    /* The monitor only goes away once every handle is dropped, so a failed
     * send can only happen during teardown, where blocking is pointless. */
    if self.request_tx.send((n, granted_tx)).await.is_ok() {
      let _ = granted_rx.await;
    }
  }

  /// Release `n` previously claimed units. Never blocks.
  pub fn finish(&self, n: u64) { let _ = self.finish_tx.send(n); }

  async fn monitor(
    quota: u64,
    mut request_rx: mpsc::Receiver<(u64, oneshot::Sender<()>)>,
    mut finish_rx: mpsc::UnboundedReceiver<u64>,
  ) {
    let mut used: u64 = 0;
    let mut pending: VecDeque<(u64, oneshot::Sender<()>)> = VecDeque::new();
    let mut requests_open = true;
    let mut finishes_open = true;

    while requests_open || finishes_open {
      tokio::select! {
        req = request_rx.recv(), if requests_open => match req {
          Some(req) => pending.push_back(req),
          None => requests_open = false,
        },
        fin = finish_rx.recv(), if finishes_open => match fin {
          Some(n) => used = used.saturating_sub(n),
          None => finishes_open = false,
        },
      }

      /* Grant from the head of the queue only, preserving arrival order even
       * when a later, smaller request would fit. */
      while let Some((n, _)) = pending.front() {
        let n = *n;
        if quota != 0 && used != 0 && used + n > quota {
          break;
        }
        let (n, granted_tx) = pending
          .pop_front()
          .expect("peeked entry must still be present");
        used += n;
        /* A dropped receiver means the requester gave up; its units were
         * never claimed on the caller side, but the matching finish() still
         * arrives, so just keep counting. */
        let _ = granted_tx.send(());
      }
    }
  }
}

/// Bounds the number of simultaneously executing compression tasks,
/// including the background crc task for large entries.
#[derive(Clone)]
pub struct CpuLimiter {
  limit: RateLimit,
}

impl CpuLimiter {
  pub fn new(parallelism: usize) -> Self {
    Self {
      limit: RateLimit::new(parallelism as u64),
    }
  }

  pub async fn request(&self) { self.limit.request(1).await }

  pub fn finish(&self) { self.limit.finish(1) }
}

/// Bounds the total bytes reserved by in-flight entries. An entry reserves
/// its uncompressed size up front and the serializing writer releases it
/// when the entry is handed over for output.
#[derive(Clone)]
pub struct MemoryLimiter {
  limit: RateLimit,
}

impl MemoryLimiter {
  /// `max_bytes == 0` means unbounded (but still accounted).
  pub fn new(max_bytes: u64) -> Self {
    Self {
      limit: RateLimit::new(max_bytes),
    }
  }

  pub async fn request(&self, n: u64) { self.limit.request(n).await }

  pub fn finish(&self, n: u64) { self.limit.finish(n) }
}

#[cfg(test)]
mod test {
  use super::*;

  use tokio::time::{sleep, timeout, Duration};

  use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
  };

  #[tokio::test(flavor = "multi_thread")]
  async fn cpu_limiter_caps_concurrency() {
    let limiter = CpuLimiter::new(2);
    let active = Arc::new(AtomicUsize::new(0));
    let high_water = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..8 {
      let limiter = limiter.clone();
      let active = Arc::clone(&active);
      let high_water = Arc::clone(&high_water);
      tasks.push(tokio::spawn(async move {
        limiter.request().await;
        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
        high_water.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(10)).await;
        active.fetch_sub(1, Ordering::SeqCst);
        limiter.finish();
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }

    assert!(high_water.load(Ordering::SeqCst) <= 2);
  }

  #[tokio::test]
  async fn memory_limiter_blocks_until_release() {
    let limiter = MemoryLimiter::new(100);
    limiter.request(60).await;

    /* A second request that would overflow the bound must park until the
     * first reservation is released. */
    let mut blocked = {
      let limiter = limiter.clone();
      tokio::spawn(async move { limiter.request(60).await })
    };
    assert!(
      timeout(Duration::from_millis(50), &mut blocked)
        .await
        .is_err()
    );

    limiter.finish(60);
    timeout(Duration::from_secs(1), blocked)
      .await
      .expect("request should be granted after release")
      .unwrap();
    limiter.finish(60);
  }

  #[tokio::test]
  async fn zero_quota_admits_immediately() {
    let limiter = MemoryLimiter::new(0);
    timeout(Duration::from_millis(50), limiter.request(u64::MAX / 2))
      .await
      .expect("unbounded limiter must not block");
    limiter.finish(u64::MAX / 2);
  }

  #[tokio::test]
  async fn oversized_request_admitted_when_idle() {
    let limiter = MemoryLimiter::new(16);
    timeout(Duration::from_millis(50), limiter.request(1024))
      .await
      .expect("oversized request must be admitted when nothing is in flight");
    limiter.finish(1024);
  }
}
