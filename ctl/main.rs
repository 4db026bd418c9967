#![forbid(unsafe_code)]

//! `backend-warden-ctl`: local CLI companion for `backend-warden`.
//!
//! Connects to the IPC socket and sends JSON commands to the server. Handy
//! for driving backends by hand without an editor attached.

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use interprocess::local_socket::{traits::Stream as _, GenericNamespaced, Stream, ToNsName};

#[derive(Debug, Parser)]
#[command(
    name = "backend-warden-ctl",
    about = "Local CLI for backend-warden",
    version,
    long_about = None
)]
struct Cli {
    /// IPC socket name (must match the server's `ipc_name` config).
    #[arg(long, default_value = "backend-warden")]
    ipc_name: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List live sessions.
    List,

    /// Run a unit, starting a backend for its document and dialect if needed.
    Execute {
        /// Document identifier (e.g. notebook URI).
        document: String,
        /// Source dialect (e.g. `vdmsl`).
        dialect: String,
        /// Stable unit identity; a fresh one is assigned when omitted.
        #[arg(long)]
        stable_id: Option<String>,
        /// Position of the unit among its siblings.
        #[arg(long, default_value_t = 0)]
        position: usize,
        /// File suffix override.
        #[arg(long)]
        suffix: Option<String>,
        /// Source text; read from `--file` or stdin when omitted.
        #[arg(long, conflicts_with = "file")]
        text: Option<String>,
        /// Read source text from this file.
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Stop backends for a document.
    Dispose {
        /// Document identifier.
        document: String,
        /// Only the backend for this dialect.
        #[arg(long)]
        dialect: Option<String>,
    },
}

fn main() {
    let args = Cli::parse();

    let request_json = match build_request(&args.command) {
        Ok(request) => request,
        Err(err) => {
            eprintln!("Error: {err}");
            std::process::exit(2);
        }
    };

    match send_ipc_command(&args.ipc_name, &request_json) {
        Ok(response) => {
            if let Some(obj) = response.as_object() {
                let ok = obj
                    .get("ok")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                if ok {
                    if let Some(data) = obj.get("data") {
                        println!("{}", serde_json::to_string_pretty(data).unwrap_or_default());
                    } else {
                        println!("OK");
                    }
                } else {
                    let err_msg = obj
                        .get("error")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown error");
                    eprintln!("Error: {err_msg}");
                    std::process::exit(1);
                }
            } else {
                println!("{response}");
            }
        }
        Err(err) => {
            eprintln!("Failed to connect to server: {err}");
            eprintln!(
                "Is backend-warden running with ipc_name '{}'?",
                args.ipc_name
            );
            std::process::exit(1);
        }
    }
}

fn build_request(command: &Command) -> std::io::Result<serde_json::Value> {
    let request = match command {
        Command::List => serde_json::json!({ "command": "list" }),
        Command::Execute {
            document,
            dialect,
            stable_id,
            position,
            suffix,
            text,
            file,
        } => {
            let text = match (text, file) {
                (Some(text), _) => text.clone(),
                (None, Some(path)) => std::fs::read_to_string(path)?,
                (None, None) => {
                    let mut buf = String::new();
                    std::io::stdin().read_to_string(&mut buf)?;
                    buf
                }
            };
            let mut req = serde_json::json!({
                "command": "execute",
                "document": document,
                "dialect": dialect,
                "position": position,
                "text": text,
            });
            if let Some(id) = stable_id {
                req["stable_id"] = serde_json::Value::String(id.clone());
            }
            if let Some(s) = suffix {
                req["suffix"] = serde_json::Value::String(s.clone());
            }
            req
        }
        Command::Dispose { document, dialect } => {
            let mut req = serde_json::json!({ "command": "dispose", "document": document });
            if let Some(d) = dialect {
                req["dialect"] = serde_json::Value::String(d.clone());
            }
            req
        }
    };
    Ok(request)
}

/// Connect to the IPC socket, send a JSON command, and read the response.
fn send_ipc_command(
    ipc_name: &str,
    request: &serde_json::Value,
) -> std::result::Result<serde_json::Value, Box<dyn std::error::Error>> {
    let name = ipc_name.to_ns_name::<GenericNamespaced>()?;
    let mut stream = Stream::connect(name)?;

    let mut request_line = serde_json::to_string(request)?;
    request_line.push('\n');
    stream.write_all(request_line.as_bytes())?;
    stream.flush()?;

    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader.read_line(&mut response_line)?;

    let response: serde_json::Value = serde_json::from_str(response_line.trim())?;
    Ok(response)
}
