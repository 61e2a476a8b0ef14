use std::process::Stdio;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command};

pub async fn execute_curl_json(
    method: &str,
    url: &str,
    api_key: Option<&str>,
    body: Option<&Value>,
    timeout_seconds: u64,
) -> Result<Value> {
    let mut child = Command::new("curl")
        .arg("-sS")
        .arg("--fail-with-body")
        .arg("--max-time")
        .arg(timeout_seconds.to_string())
        .arg("-X")
        .arg(method)
        .arg("-H")
        .arg("Content-Type: application/json")
        .arg("--config")
        .arg("-")
        .arg(url)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute curl for {method} {url}"))?;

    // Header and body go through stdin: argv is capped per argument and shows up in `ps`.
    let config = curl_config(api_key, body);
    let mut stdin = child
        .stdin
        .take()
        .with_context(|| format!("curl stdin unavailable for {method} {url}"))?;
    let feed = async move {
        stdin.write_all(config.as_bytes()).await?;
        stdin.shutdown().await
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output.with_context(|| format!("Failed waiting on curl for {method} {url}"))?;

    let stdout = String::from_utf8(output.stdout)
        .with_context(|| format!("Response from {url} was not valid UTF-8"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!(
            "{method} {url} failed: {} {}",
            stderr.trim(),
            stdout.trim()
        );
    }
    fed.with_context(|| format!("Failed writing request to curl for {method} {url}"))?;

    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str::<Value>(&stdout).with_context(|| {
        format!(
            "Failed to parse JSON response for {method} {url}: {}",
            stdout.trim()
        )
    })
}

fn curl_config(api_key: Option<&str>, body: Option<&Value>) -> String {
    let mut config = String::new();
    if let Some(api_key) = api_key {
        config.push_str(&format!(
            "header = \"{}\"\n",
            quote_config(&format!("Authorization: Bearer {api_key}"))
        ));
    }
    if let Some(body) = body {
        // Serialized JSON never starts with '@', so curl takes it literally.
        config.push_str(&format!("data-binary = \"{}\"\n", quote_config(&body.to_string())));
    }
    config
}

fn quote_config(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '"' => quoted.push_str("\\\""),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted
}
