use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "sealchain-cli")]
#[command(about = "CLI client for the sealchain node")]
struct Cli {
    /// Node base URL (e.g. http://127.0.0.1:8080)
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
enum Kind {
    Single,
    Multi,
    Ranked,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an entity with a fresh chain
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, value_enum, default_value_t = Kind::Single)]
        kind: Kind,
        /// Comma separated candidate names
        #[arg(long, value_delimiter = ',')]
        candidates: Vec<String>,
    },
    /// List entity ids
    List,
    /// Show entity metadata
    Show { id: String },
    /// Print the full chain of an entity
    Chain { id: String },
    /// Add a transaction and mine it into a new block
    Sign {
        id: String,
        /// Transaction payload; sent as JSON when it parses, as a string otherwise
        #[arg(long)]
        transaction: String,
        /// Opaque tag stored on the block
        #[arg(long)]
        data: String,
    },
    /// Rehash and relink the whole chain
    Verify { id: String },
    /// Count the ballots recorded on the chain
    Tally { id: String },
    /// Delete an entity and its chain
    Purge { id: String },
}

#[derive(Serialize)]
struct NewEntity {
    title: String,
    description: String,
    kind: Kind,
    candidates: Vec<String>,
}

#[derive(Serialize)]
struct SignRequest {
    transaction: Value,
    data: String,
}

fn parse_transaction(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

async fn send<B: Serialize>(client: &Client, method: Method, url: String, body: Option<&B>) -> Result<()> {
    debug!(%method, %url, "sending request");
    let mut req = client.request(method, url);
    if let Some(body) = body {
        req = req.json(body);
    }
    let res = req.send().await?;
    let status = res.status();
    let body = res.text().await?;
    println!("status: {}", status);
    println!("{body}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .pretty()
        .init();

    let cli = Cli::parse();
    let client = Client::new();
    let node = cli.node.trim_end_matches('/');
    let none: Option<&Value> = None;

    match cli.cmd {
        Command::Create { title, description, kind, candidates } => {
            let body = NewEntity { title, description, kind, candidates };
            send(&client, Method::POST, format!("{node}/entities"), Some(&body)).await?;
        }
        Command::List => send(&client, Method::GET, format!("{node}/entities"), none).await?,
        Command::Show { id } => {
            send(&client, Method::GET, format!("{node}/entities/{id}"), none).await?
        }
        Command::Chain { id } => {
            send(&client, Method::GET, format!("{node}/entities/{id}/chain"), none).await?
        }
        Command::Sign { id, transaction, data } => {
            let body = SignRequest {
                transaction: parse_transaction(&transaction),
                data,
            };
            send(&client, Method::POST, format!("{node}/entities/{id}/sign"), Some(&body)).await?;
        }
        Command::Verify { id } => {
            send(&client, Method::GET, format!("{node}/entities/{id}/verify"), none).await?
        }
        Command::Tally { id } => {
            send(&client, Method::GET, format!("{node}/entities/{id}/tally"), none).await?
        }
        Command::Purge { id } => {
            send(&client, Method::DELETE, format!("{node}/entities/{id}"), none).await?
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn transaction_json_or_string() {
        assert_eq!(parse_transaction(r#"["ann","bo"]"#), json!(["ann", "bo"]));
        assert_eq!(parse_transaction("[ann, bo]"), json!("[ann, bo]"));
        assert_eq!(parse_transaction("42"), json!(42));
    }

    #[test]
    fn create_args_parse() {
        let cli = Cli::parse_from([
            "sealchain-cli",
            "create",
            "--title",
            "Board",
            "--kind",
            "ranked",
            "--candidates",
            "ann,bo,cy",
        ]);
        match cli.cmd {
            Command::Create { title, kind, candidates, .. } => {
                assert_eq!(title, "Board");
                assert!(matches!(kind, Kind::Ranked));
                assert_eq!(candidates, vec!["ann", "bo", "cy"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(cli.node, "http://127.0.0.1:8080");
    }
}
