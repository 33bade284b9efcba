//! Standalone client binary for a minikv server
//!
//! Provides a command-line interface for interacting with the server

use minikv::protocol::{parse_command, Command};
use minikv::Client;
use std::env;
use std::io::{self, Write};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    let server_addr = args.get(1).cloned().unwrap_or_else(|| "127.0.0.1:6379".to_string());

    println!("Connecting to minikv server at {}...", server_addr);
    let mut client = Client::connect(&server_addr).await?;
    println!("Connected! Type 'help' for available commands or 'quit' to exit.");

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.is_empty() {
            continue;
        }

        match input.to_ascii_lowercase().as_str() {
            "quit" | "exit" => {
                println!("Goodbye!");
                break;
            }
            "help" => {
                print_help();
            }
            _ => {
                if let Err(e) = handle_command(&mut client, input).await {
                    println!("Error: {}", e);
                }
            }
        }
    }

    client.close().await?;
    Ok(())
}

async fn handle_command(client: &mut Client, input: &str) -> Result<(), Box<dyn std::error::Error>> {
    // Same tokenizer as the server: quoted tokens, case-insensitive names
    match parse_command(input)? {
        Command::Set { key, value, ttl: None } => {
            client.set(&key, value).await?;
            println!("OK");
        }
        Command::Set { key, value, ttl: Some(ttl) } => {
            client.set_with_ttl(&key, value, ttl).await?;
            println!("OK");
        }
        Command::Get { key } => match client.get(&key).await? {
            Some(value) => println!("{}", value),
            None => println!("(nil)"),
        },
        Command::Delete { key } => {
            if client.delete(&key).await? {
                println!("OK");
            } else {
                println!("Key not found");
            }
        }
        Command::Exists { key } => println!("{}", client.exists(&key).await?),
        Command::Expire { key, ttl } => {
            if client.expire(&key, ttl).await? {
                println!("OK");
            } else {
                println!("Key not found");
            }
        }
        Command::Size => println!("{}", client.size().await?),
        Command::Show => {
            let lines = client.show().await?;
            if lines.is_empty() {
                println!("(empty)");
            }
            for line in lines {
                println!("{}", line);
            }
        }
        Command::Save { file } => {
            client.save(&file).await?;
            println!("OK");
        }
        Command::Load { file } => println!("Loaded {} keys", client.load(&file).await?),
        Command::Quit => {}
    }

    Ok(())
}

fn print_help() {
    println!("Available commands (names are case-insensitive, quote keys or values with spaces):");
    println!("  set <key> <value> [ttl]  - Set a key-value pair, optionally expiring after ttl seconds");
    println!("  get <key>                - Get value by key");
    println!("  del <key>                - Delete a key");
    println!("  exists <key>             - Check whether a key exists");
    println!("  expire <key> <ttl>       - Expire a key after ttl seconds");
    println!("  size                     - Number of live keys");
    println!("  show                     - List all live keys");
    println!("  save <file>              - Save the store to a file");
    println!("  load <file>              - Load the store from a file");
    println!("  help                     - Show this help message");
    println!("  quit                     - Exit the client");
}
