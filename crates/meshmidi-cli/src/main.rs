use clap::{Parser, Subcommand};
use serde_json::Value;

#[derive(Parser, Debug)]
#[command(name = "meshmidi", about = "meshmidi node control CLI")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Target node's control API URL
    #[arg(short, long, default_value = "http://localhost:7070", global = true)]
    url: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show node status and connected peers
    Status,
    /// List local and remote MIDI devices
    Devices,
    /// List routing rules
    Rules,
    /// Add a routing rule (local source device id -> local or remote dest)
    AddRule {
        rule_id: u32,
        source_device: u16,
        dest_device: u16,
        #[arg(long)]
        dest_owner: Option<String>,
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },
    /// Remove a routing rule by id
    RemoveRule { rule_id: u32 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = reqwest::Client::new();
    let base = args.url.trim_end_matches('/');

    match args.command {
        Commands::Status => {
            let resp: Value = client.get(format!("{}/status", base)).send().await?.json().await?;
            println!("Node Status");
            println!("══════════════════════════════");
            println!("  Name:     {}", resp["node"]["name"]);
            println!("  UUID:     {}", resp["node"]["uuid"]);
            println!("  Routed:   {}", resp["metrics"]["messages_routed"]);
            println!("  Dropped:  {}", resp["metrics"]["messages_dropped"]);
            println!("  No route: {}", resp["metrics"]["no_route"]);
            println!();
            println!("Connections");
            println!("══════════════════════════════");
            if let Some(conns) = resp["connections"].as_array() {
                if conns.is_empty() {
                    println!("  (none)");
                }
                for c in conns {
                    println!(
                        "  {} [{}] state={} heartbeat_age={}ms",
                        c["name"], c["uuid"], c["state"], c["heartbeat_age_ms"]
                    );
                }
            }
        }
        Commands::Devices => {
            let resp: Value = client.get(format!("{}/devices", base)).send().await?.json().await?;
            println!("Local Devices");
            println!("══════════════════════════════");
            if let Some(devices) = resp["local"].as_array() {
                if devices.is_empty() {
                    println!("  (none)");
                }
                for d in devices {
                    println!("  #{} {} ({})", d["device_id"], d["name"], d["direction"]);
                }
            }
        }
        Commands::Rules => {
            let resp: Value = client.get(format!("{}/rules", base)).send().await?.json().await?;
            println!("Routing Rules");
            println!("══════════════════════════════");
            if let Some(rules) = resp["rules"].as_array() {
                if rules.is_empty() {
                    println!("  (none)");
                }
                for r in rules {
                    println!(
                        "  #{} priority={} enabled={} routed={} dropped={} {:?} -> {:?}",
                        r["rule_id"], r["priority"], r["enabled"], r["messages_routed"],
                        r["messages_dropped"], r["source"], r["dest"]
                    );
                }
            }
        }
        Commands::AddRule {
            rule_id,
            source_device,
            dest_device,
            dest_owner,
            priority,
        } => {
            let source = serde_json::json!({ "owner": Value::Null, "device_id": source_device });
            let dest = serde_json::json!({ "owner": dest_owner, "device_id": dest_device });
            let body = serde_json::json!({
                "rule_id": rule_id,
                "source": source,
                "dest": dest,
                "priority": priority,
                "enabled": true,
                "channel_filter": Value::Null,
                "message_type_filter": Value::Null,
            });
            let status = client.post(format!("{}/rules", base)).json(&body).send().await?.status();
            println!("add-rule: {}", status);
        }
        Commands::RemoveRule { rule_id } => {
            let status = client
                .delete(format!("{}/rules/{}", base, rule_id))
                .send()
                .await?
                .status();
            println!("remove-rule: {}", status);
        }
    }

    Ok(())
}
