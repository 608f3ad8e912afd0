//! Poll scheduler: one independent task per metric definition.
//!
//! Every task owns its ticker and its gauge family. Tasks never wait on each
//! other; a failing or slow definition only delays itself. The first poll
//! fires as soon as the task starts, subsequent polls every `interval`.

use crate::{
    jira::{PollError, SearchClient},
    metrics::{MetricFamily, MetricRegistry, PollStats},
};
use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument as _, debug, info, info_span, instrument};

pub struct Scheduler {
    client: Arc<SearchClient>,
    registry: MetricRegistry,
}

impl Scheduler {
    pub fn new(client: SearchClient, registry: MetricRegistry) -> Self {
        Self {
            client: Arc::new(client),
            registry,
        }
    }

    /// Poll every registered family until `token` is cancelled.
    ///
    /// Returns only after every poll task has observed the cancellation and
    /// exited. With no families it simply waits for the cancellation.
    pub async fn run(&self, token: CancellationToken) {
        let tracker = TaskTracker::new();

        for family in self.registry.families() {
            let span = info_span!("poll.task", metric = %family.name());
            tracker.spawn(
                poll_loop(
                    Arc::clone(&self.client),
                    family.clone(),
                    self.registry.polls().clone(),
                    token.clone(),
                )
                .instrument(span),
            );
        }

        tracker.close();
        info!(tasks = tracker.len(), "poll scheduler started");

        token.cancelled().await;
        tracker.wait().await;

        info!("poll scheduler stopped");
    }
}

async fn poll_loop(
    client: Arc<SearchClient>,
    family: MetricFamily,
    polls: PollStats,
    token: CancellationToken,
) {
    let mut ticker = interval(family.definition().interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // cancellation wins over a tick that is ready at the same time
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // failures are logged by the span and leave the family untouched
        let _ = poll_cycle(&client, &family, &polls).await;
    }

    info!("stopping worker for {}", family.name());
}

/// One request, decode and publish cycle for `family`.
///
/// On failure the family keeps the values of the last successful cycle.
///
/// # Errors
///
/// Returns the `PollError` of the failing stage; the caller only logs it
#[instrument(
    skip(client, family, polls),
    level = "info",
    err,
    fields(metric = %family.name())
)]
pub async fn poll_cycle(
    client: &SearchClient,
    family: &MetricFamily,
    polls: &PollStats,
) -> Result<(), PollError> {
    let timer = polls.start_poll(family.name());

    match client.search(family.definition()).await {
        Ok(observations) => {
            family.publish(&observations);
            timer.success();
            debug!(?observations, "published observations");
            Ok(())
        }
        Err(e) => {
            timer.error(e.stage());
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, GroupBy, MetricDefinition};
    use mockito::{Matcher, Server};
    use reqwest::header::HeaderMap;
    use secrecy::SecretString;
    use std::{
        collections::BTreeMap,
        time::{Duration, Instant},
    };
    use tokio::time::{sleep, timeout};

    fn config(base_url: &str) -> Config {
        Config {
            base_url: base_url.to_string(),
            login: "login".to_string(),
            password: SecretString::from("password"),
            http_headers: HeaderMap::new(),
            max_results: 100,
            request_timeout: Duration::from_secs(5),
            metrics: Vec::new(),
        }
    }

    fn definition(name: &str, interval: Duration) -> MetricDefinition {
        MetricDefinition {
            name: name.to_string(),
            help: "test".to_string(),
            jql: format!("project = {name}"),
            interval,
            labels: BTreeMap::new(),
            group_by: Some(GroupBy {
                field: "components".to_string(),
                label: "component".to_string(),
            }),
        }
    }

    fn counts(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_no_metrics_returns_after_cancel() {
        let registry = MetricRegistry::new(&[]).unwrap();
        let client = SearchClient::new(&config("")).unwrap();
        let scheduler = Scheduler::new(client, registry);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        timeout(Duration::from_secs(5), scheduler.run(token))
            .await
            .expect("scheduler should return after cancellation");
    }

    #[tokio::test]
    async fn test_no_metrics_waits_for_cancel() {
        let registry = MetricRegistry::new(&[]).unwrap();
        let client = SearchClient::new(&config("")).unwrap();
        let scheduler = Scheduler::new(client, registry);

        let result = timeout(
            Duration::from_millis(100),
            scheduler.run(CancellationToken::new()),
        )
        .await;
        assert!(result.is_err(), "scheduler must run until cancelled");
    }

    #[tokio::test]
    async fn test_cycle_replaces_previous_observations() {
        let registry =
            MetricRegistry::new(&[definition("TEST", Duration::from_secs(60))]).unwrap();
        let family = &registry.families()[0];

        let mut first = Server::new_async().await;
        let _m1 = first
            .mock("GET", "/rest/api/2/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(
                r#"{"issues":[
                    {"fields":{"components":[{"name":"A"}]}},
                    {"fields":{"components":[{"name":"A"}]}},
                    {"fields":{"components":[{"name":"B"}]}}
                ]}"#,
            )
            .create_async()
            .await;

        let client = SearchClient::new(&config(&first.url())).unwrap();
        poll_cycle(&client, family, registry.polls()).await.unwrap();
        assert_eq!(family.snapshot(), counts(&[("A", 2.0), ("B", 1.0)]));

        let mut second = Server::new_async().await;
        let _m2 = second
            .mock("GET", "/rest/api/2/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"issues":[{"fields":{"components":[{"name":"A"}]}}]}"#)
            .create_async()
            .await;

        let client = SearchClient::new(&config(&second.url())).unwrap();
        poll_cycle(&client, family, registry.polls()).await.unwrap();
        assert_eq!(family.snapshot(), counts(&[("A", 1.0)]));
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_previous_values() {
        let registry =
            MetricRegistry::new(&[definition("TEST", Duration::from_secs(60))]).unwrap();
        let family = &registry.families()[0];

        let mut server = Server::new_async().await;
        let ok = server
            .mock("GET", "/rest/api/2/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"issues":[{"fields":{"components":[{"name":"A"}]}}]}"#)
            .create_async()
            .await;

        let client = SearchClient::new(&config(&server.url())).unwrap();
        poll_cycle(&client, family, registry.polls()).await.unwrap();
        ok.remove_async().await;

        let _failing = server
            .mock("GET", "/rest/api/2/search")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;

        let err = poll_cycle(&client, family, registry.polls())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), "status");
        assert_eq!(family.snapshot(), counts(&[("A", 1.0)]));

        let text = registry.render().unwrap();
        assert!(text.contains(r#"jira_exporter_last_poll_success{metric="TEST"} 0"#));
    }

    #[tokio::test]
    async fn test_run_polls_immediately_and_stops_on_cancel() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/rest/api/2/search")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"issues":[{"fields":{"components":[{"name":"A"}]}}]}"#)
            .create_async()
            .await;

        // interval far longer than the test: only the immediate first tick fires
        let registry =
            MetricRegistry::new(&[definition("TEST", Duration::from_secs(3600))]).unwrap();
        let client = SearchClient::new(&config(&server.url())).unwrap();
        let scheduler = Scheduler::new(client, registry.clone());

        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { scheduler.run(run_token).await });

        let family = registry.families()[0].clone();
        assert!(wait_for(|| family.snapshot() == counts(&[("A", 1.0)])).await);

        token.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should join all tasks")
            .unwrap();
    }

    #[tokio::test]
    async fn test_failing_metric_does_not_block_others() {
        let mut server = Server::new_async().await;
        let _good = server
            .mock("GET", "/rest/api/2/search")
            .match_query(Matcher::UrlEncoded("jql".into(), "project = GOOD".into()))
            .with_status(200)
            .with_body(r#"{"issues":[{"fields":{"components":[{"name":"A"}]}}]}"#)
            .expect_at_least(2)
            .create_async()
            .await;
        let _bad = server
            .mock("GET", "/rest/api/2/search")
            .match_query(Matcher::UrlEncoded("jql".into(), "project = BAD".into()))
            .with_status(503)
            .create_async()
            .await;

        let registry = MetricRegistry::new(&[
            definition("BAD", Duration::from_millis(50)),
            definition("GOOD", Duration::from_millis(50)),
        ])
        .unwrap();
        let client = SearchClient::new(&config(&server.url())).unwrap();
        let scheduler = Scheduler::new(client, registry.clone());

        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { scheduler.run(run_token).await });

        let bad = registry.families()[0].clone();
        let good = registry.families()[1].clone();
        assert!(wait_for(|| good.snapshot() == counts(&[("A", 1.0)])).await);

        sleep(Duration::from_millis(200)).await;
        assert!(bad.snapshot().is_empty());

        token.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should join all tasks")
            .unwrap();

        let text = registry.render().unwrap();
        assert!(text.contains(r#"jira_exporter_last_poll_success{metric="GOOD"} 1"#));
        assert!(text.contains(r#"jira_exporter_last_poll_success{metric="BAD"} 0"#));
    }

    #[tokio::test]
    async fn test_cancel_joins_every_task() {
        // unreachable endpoint: every task keeps failing until cancelled
        let definitions: Vec<_> = (0..16)
            .map(|i| definition(&format!("m{i}"), Duration::from_millis(10)))
            .collect();
        let registry = MetricRegistry::new(&definitions).unwrap();
        let client = SearchClient::new(&config("http://127.0.0.1:9")).unwrap();
        let scheduler = Scheduler::new(client, registry);

        let token = CancellationToken::new();
        let run_token = token.clone();
        let handle = tokio::spawn(async move { scheduler.run(run_token).await });

        sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        token.cancel();
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("scheduler should join all tasks")
            .unwrap();
    }
}
