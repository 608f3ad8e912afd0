#![allow(dead_code)]

use anyhow::Result;
use jira_exporter::{config::Config, jira::SearchClient, metrics::MetricRegistry};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// A running exporter bound to an ephemeral port.
pub struct TestExporter {
    pub port: u16,
    pub registry: MetricRegistry,
    pub token: CancellationToken,
    pub handle: JoinHandle<Result<()>>,
}

impl TestExporter {
    /// Stop the exporter and wait for the server and every poll task.
    pub async fn stop(self) -> Result<()> {
        self.token.cancel();
        self.handle.await?
    }
}

/// Minimal configuration pointing at `base_url`. `metrics` is a YAML sequence
/// already indented for the `metrics:` key; empty means no metrics at all.
pub fn config_yaml(base_url: &str, metrics: &str) -> String {
    let mut yaml = format!("baseURL: {base_url}\nlogin: login\npassword: password\n");
    if !metrics.is_empty() {
        yaml.push_str("metrics:\n");
        yaml.push_str(metrics);
    }
    yaml
}

/// Start the exporter for `yaml` on 127.0.0.1 with an OS assigned port.
pub async fn start_exporter(yaml: &str) -> Result<TestExporter> {
    let config = Config::from_yaml(yaml)?;
    let registry = MetricRegistry::new(&config.metrics)?;
    let client = SearchClient::new(&config)?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let token = CancellationToken::new();
    let handle = tokio::spawn(jira_exporter::exporter::serve(
        listener,
        registry.clone(),
        client,
        token.clone(),
    ));

    assert!(wait_for_server(port, 50).await, "Server failed to start");

    Ok(TestExporter {
        port,
        registry,
        token,
        handle,
    })
}

/// Wait for server to be ready on the given port
///
/// # Arguments
/// * `port` - The port number to connect to
/// * `max_attempts` - Maximum number of connection attempts (50 = 5 seconds at 100ms intervals)
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    use tokio::time::{Duration, sleep};

    for attempt in 1..=max_attempts {
        if tokio::net::TcpStream::connect(format!("127.0.0.1:{port}"))
            .await
            .is_ok()
        {
            return true;
        }

        if attempt % 10 == 0 {
            eprintln!("Still waiting for server on port {port} (attempt {attempt}/{max_attempts})");
        }

        sleep(Duration::from_millis(100)).await;
    }

    eprintln!("Failed to connect to server on port {port} after {max_attempts} attempts");
    false
}

/// Poll `url` until the body contains `needle`, returning the last body.
pub async fn wait_for_body(url: &str, needle: &str) -> Result<String> {
    use tokio::time::{Duration, sleep};

    let client = reqwest::Client::new();
    let mut body = String::new();

    for _ in 0..50 {
        body = client.get(url).send().await?.text().await?;
        if body.contains(needle) {
            break;
        }
        sleep(Duration::from_millis(100)).await;
    }

    Ok(body)
}

/// Get base URL for test server
pub fn get_test_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}")
}
