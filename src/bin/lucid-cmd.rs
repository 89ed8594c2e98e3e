//! LUCID command injection utility
//!
//! Publishes one command to a running agent and prints the matching result.
//!
//! ## Usage
//!
//! ```bash
//! # Liveness check
//! lucid-cmd --agent-id agent_1 ping
//!
//! # Runtime config change
//! lucid-cmd --agent-id agent_1 cfg/set --payload '{"set": {"heartbeat_s": 10}}'
//!
//! # Component install
//! lucid-cmd --agent-id agent_1 components/install --payload \
//!   '{"component_id": "cpu", "version": "1.2.3", "entrypoint": "lucid_cpu.component:CpuComponent", "source": {"type": "github_release", "owner": "o", "repo": "lucid-component-cpu", "tag": "v1.2.3", "asset": "lucid_component_cpu-1.2.3-py3-none-any.whl", "sha256": "..."}}'
//!
//! # Component command
//! lucid-cmd --agent-id agent_1 --component dummy reset
//! ```

use clap::Parser;
use lucid_agent_core::protocol::topics::TopicSchema;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{timeout, Duration};
use uuid::Uuid;

#[derive(Parser)]
#[command(
    name = "lucid-cmd",
    about = "Send a command to a LUCID agent and wait for its result"
)]
struct Args {
    /// Target agent ID
    #[arg(long, required = true)]
    agent_id: String,

    /// Target component; omit for agent-level commands
    #[arg(long)]
    component: Option<String>,

    /// Action, e.g. `ping`, `cfg/set`, `components/install`
    action: String,

    /// JSON object sent as the command body; `request_id` is added if missing
    #[arg(long, default_value = "{}")]
    payload: String,

    /// Seconds to wait for the result
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    broker_host: String,

    /// MQTT broker port
    #[arg(long, default_value = "1883")]
    broker_port: u16,

    /// Broker username
    #[arg(long, env = "LUCID_MQTT_USERNAME")]
    username: Option<String>,

    /// Broker password
    #[arg(long, env = "LUCID_MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

fn build_payload(raw: &str) -> Result<(String, String), Box<dyn std::error::Error>> {
    let mut body: Map<String, Value> = match serde_json::from_str(raw)? {
        Value::Object(body) => body,
        _ => return Err("--payload must be a JSON object".into()),
    };
    let request_id = match body.get("request_id").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let id = Uuid::new_v4().to_string();
            body.insert("request_id".to_string(), Value::String(id.clone()));
            id
        }
    };
    Ok((request_id, serde_json::to_string(&body)?))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let topics = TopicSchema::new(&args.agent_id)?;
    let (cmd_topic, result_topic) = match &args.component {
        Some(component_id) => (
            topics.component_cmd(component_id, &args.action)?,
            topics.component_evt_result(component_id, &args.action)?,
        ),
        None => (topics.cmd(&args.action)?, topics.evt_result(&args.action)?),
    };
    let (request_id, payload) = match build_payload(&args.payload) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("✗ Invalid payload: {e}");
            std::process::exit(1);
        }
    };

    let client_id = format!(
        "lucid-cmd-{}",
        SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis()
    );
    let mut options = MqttOptions::new(client_id, &args.broker_host, args.broker_port);
    options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (&args.username, &args.password) {
        options.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(options, 10);
    client.subscribe(&result_topic, QoS::AtLeastOnce).await?;

    println!("📤 {cmd_topic}");
    println!("   request_id: {request_id}");

    let wait = async {
        let mut published = false;
        loop {
            match eventloop.poll().await? {
                Event::Incoming(Packet::SubAck(_)) if !published => {
                    client
                        .publish(&cmd_topic, QoS::AtLeastOnce, false, payload.clone())
                        .await?;
                    published = true;
                }
                Event::Incoming(Packet::Publish(publish)) if publish.topic == result_topic => {
                    let result: Value = serde_json::from_slice(&publish.payload)?;
                    if result.get("request_id").and_then(Value::as_str) == Some(request_id.as_str())
                    {
                        return Ok::<Value, Box<dyn std::error::Error>>(result);
                    }
                }
                _ => {}
            }
        }
    };

    match timeout(Duration::from_secs(args.timeout_secs), wait).await {
        Ok(Ok(result)) => {
            println!("📥 {result_topic}");
            println!("{}", serde_json::to_string_pretty(&result)?);
            let _ = client.disconnect().await;
            if result.get("ok").and_then(Value::as_bool) == Some(true) {
                Ok(())
            } else {
                std::process::exit(2);
            }
        }
        Ok(Err(e)) => {
            eprintln!("✗ MQTT error: {e}");
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("✗ No result within {}s", args.timeout_secs);
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_added_when_missing() {
        let (request_id, payload) = build_payload(r#"{"set":{"heartbeat_s":10}}"#).unwrap();
        let body: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(body["request_id"], request_id.as_str());
        assert_eq!(body["set"]["heartbeat_s"], 10);
    }

    #[test]
    fn test_existing_request_id_kept() {
        let (request_id, _) = build_payload(r#"{"request_id":"abc"}"#).unwrap();
        assert_eq!(request_id, "abc");
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(build_payload("[1,2]").is_err());
    }
}
