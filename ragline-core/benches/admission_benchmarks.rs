use std::sync::Arc;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use tokio::time::Instant;

use ragline_core::rate_limit::{BucketStore, LimiterPolicy, Limits, RateLimiter, TokenBucket};
use ragline_core::{Command, CommandKind, Payload, RetryPolicy};

fn bench_token_bucket(c: &mut Criterion) {
    let now = Instant::now();
    let bucket = TokenBucket::new(u32::MAX, 1_000_000.0, now);

    c.bench_function("bucket_try_consume", |b| {
        b.iter(|| bucket.try_consume(black_box(1), now))
    });

    c.bench_function("bucket_peek", |b| b.iter(|| bucket.peek(black_box(now))));
}

fn bench_limiter(c: &mut Criterion) {
    let limits = Limits {
        capacity: u32::MAX,
        refill_rate: 1_000_000.0,
    };
    let limiter = RateLimiter::new(LimiterPolicy::new(limits), Arc::new(BucketStore::new()));
    let command = Command::question("bench-session", "How many orders?");

    c.bench_function("limiter_check_single_session", |b| {
        b.iter(|| limiter.check(black_box(&command)))
    });

    let scoped = RateLimiter::new(
        LimiterPolicy::new(limits).with_override(CommandKind::Retrieve, limits),
        Arc::new(BucketStore::new()),
    );
    let retrieve = command.follow(Payload::Retrieve);
    c.bench_function("limiter_check_scoped_kind", |b| {
        b.iter(|| scoped.check(black_box(&retrieve)))
    });

    let sessions: Vec<Command> = (0..1_000)
        .map(|i| Command::question(format!("session-{i}"), "q"))
        .collect();
    let mut idx = 0;
    c.bench_function("limiter_check_1000_sessions", |b| {
        b.iter(|| {
            idx = (idx + 1) % sessions.len();
            limiter.check(black_box(&sessions[idx]))
        })
    });
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::database();
    c.bench_function("retry_delay_for", |b| {
        b.iter(|| policy.delay_for(black_box(3)))
    });
}

criterion_group!(benches, bench_token_bucket, bench_limiter, bench_backoff);
criterion_main!(benches);
