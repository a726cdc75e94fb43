// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic cache layer usage example.
//!
//! Demonstrates:
//! 1. Building the layer (Redis if REDIS_URL is set, in-process otherwise)
//! 2. Cached reads and writes gated by feature flags
//! 3. Rule-driven invalidation of tagged entries
//! 4. Shedding features as store usage climbs
//! 5. The combined report and captured metrics
//! 6. Clean shutdown
//!
//! # Run
//!
//! ```bash
//! cargo run --example basic_usage
//! REDIS_URL=redis://localhost:6379 cargo run --example basic_usage
//! ```

use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use resilient_cache::{CacheLayer, CacheLayerConfig};
use serde_json::json;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║          resilient-cache: Basic Usage Example                 ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the layer
    // ─────────────────────────────────────────────────────────────────────────
    let config = CacheLayerConfig {
        redis_url: std::env::var("REDIS_URL").ok(),
        instance_id: Some("demo-node".into()),
        health_interval_secs: 0,
        adaptive_interval_secs: 0,
        ..Default::default()
    };
    println!("🔌 Connecting (redis_url = {:?})...", config.redis_url);

    let (_config_tx, config_rx) = watch::channel(config.clone());
    let layer = CacheLayer::connect(config, config_rx).await?;
    layer.start().await?;
    println!("   ✅ Layer ready! State: {:?}\n", layer.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Cached access
    // ─────────────────────────────────────────────────────────────────────────
    println!("📝 Caching course pages...");
    let engine = layer.invalidation();
    for lesson in 1..=3 {
        let key = format!("page:course:42:lesson:{}", lesson);
        layer
            .gated_set("course_caching", &key, format!("<h1>Lesson {}</h1>", lesson), Some(Duration::from_secs(300)))
            .await?;
        engine.tag_key(&key, &["course:42"]).await?;
        println!("   └─ {}", key);
    }
    layer.gated_set("auth_caching", "auth:u1:token", "opaque", None).await?;

    let page = layer.gated_get("course_caching", "page:course:42:lesson:2").await?;
    println!("   🔍 lesson 2 → {:?}\n", page);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Invalidation
    // ─────────────────────────────────────────────────────────────────────────
    println!("🧹 Publishing course.updated...");
    let report = engine
        .trigger("course.updated", json!({"course_id": 42}), None, Some("cms".into()))
        .await;
    println!(
        "   └─ rules matched={} executed={} keys invalidated={} propagated={}",
        report.rules_matched, report.rules_executed, report.keys_invalidated, report.propagated
    );
    let page = layer.gated_get("course_caching", "page:course:42:lesson:2").await?;
    println!("   🔍 lesson 2 after invalidation → {:?}\n", page);

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Adaptive gating
    // ─────────────────────────────────────────────────────────────────────────
    let controller = layer.controller();
    controller.on_feature_change("*", |name, enabled| {
        println!("   🔔 {} → {}", name, if enabled { "enabled" } else { "disabled" });
    });
    for usage in [40.0, 78.0, 92.0, 30.0] {
        let mode = controller.auto_optimize(usage);
        let batch = layer.scheduler().config();
        println!(
            "📈 usage {:>5.1}% → {} (batch max={}, window={:?})",
            usage, mode, batch.max_batch_size, batch.batch_timeout
        );
    }
    println!(
        "   🔐 auth_caching still enabled: {}\n",
        controller.is_feature_enabled("auth_caching")
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Report and metrics
    // ─────────────────────────────────────────────────────────────────────────
    layer.health_check().await;
    println!("📊 Layer report:");
    println!("{}", layer.report().to_json()?);

    println!("\n📊 Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    layer.shutdown().await;
    println!("   ✅ Shutdown complete! State: {:?}", layer.state());

    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_kind, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let avg = if count > 0 { sum / count as f64 } else { 0.0 };
                histograms.push((name, label_str, count, avg));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0));
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    histograms.sort_by(|a, b| a.0.cmp(&b.0));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (distributions)");
        for (name, labels, count, avg) in &histograms {
            println!("   │  └─ {}{} count={} avg={:.4}", name, labels, count, avg);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
