//! Interactive command shell over stdin.
//!
//! Lookups print "not found" rather than failing; rejected operations print
//! one short line and the prompt loop continues.

use std::sync::Arc;

use emberd_consensus::{hash256_from_hex, hash256_to_hex};
use emberd_primitives::keys::public_key_from_hex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::node::Node;

const HELP: &str = "commands:
  mine <data>                start a single proof search
  mineloop <data>            keep mining until stoploop
  stoploop                   stop the mining loop
  send <pubkey_hex> <amount> pay from the node account
  account                    show the node account public key
  balance [pubkey_hex]       balance of an account (default: own)
  unspent [pubkey_hex]       unspent outputs of an account (default: own)
  peer add <host:port>       connect to a peer
  peer list                  list connected peers
  block [hash]               show a block (default: tip)
  blocktxs <hash>            list a block's transactions
  tx <txid>                  show a transaction
  importprivatekey <hex>     replace the node account key
  q                          quit";

pub async fn run(node: Arc<Node>) -> Result<(), String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout
            .write_all(b"> ")
            .await
            .map_err(|err| err.to_string())?;
        stdout.flush().await.map_err(|err| err.to_string())?;
        let Some(line) = lines.next_line().await.map_err(|err| err.to_string())? else {
            return Ok(());
        };
        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let rest: Vec<&str> = words.collect();
        match command {
            "q" => return Ok(()),
            "help" => println!("{HELP}"),
            "mine" => {
                let data = rest.join(" ");
                match node.mine(data).await {
                    Ok(hash) => println!("mined {}", hash256_to_hex(&hash)),
                    Err(err) => println!("mining failed: {err}"),
                }
            }
            "mineloop" => {
                node.mine_loop(rest.join(" "));
                println!("mining loop started");
            }
            "stoploop" => {
                node.stop_mining();
                println!("mining loop stopped");
            }
            "send" => match rest.as_slice() {
                [pubkey_hex, amount] => {
                    let Ok(to) = public_key_from_hex(pubkey_hex) else {
                        println!("invalid public key");
                        continue;
                    };
                    let Ok(amount) = amount.parse::<u64>() else {
                        println!("invalid amount");
                        continue;
                    };
                    match node.send(to, amount).await {
                        Ok(txid) => println!("sent {}", hash256_to_hex(&txid)),
                        Err(err) => println!("send failed: {err}"),
                    }
                }
                _ => println!("usage: send <pubkey_hex> <amount>"),
            },
            "account" => println!("{}", node.account()),
            "balance" => match parse_optional_pubkey(&rest) {
                Ok(public_key) => println!("{}", node.balance(public_key)),
                Err(message) => println!("{message}"),
            },
            "unspent" => match parse_optional_pubkey(&rest) {
                Ok(public_key) => {
                    let unspent = node.unspent(public_key);
                    if unspent.is_empty() {
                        println!("no unspent outputs");
                    }
                    for utxo in unspent {
                        println!(
                            "{}:{} {}",
                            hash256_to_hex(&utxo.txid),
                            utxo.index,
                            utxo.output.amount
                        );
                    }
                }
                Err(message) => println!("{message}"),
            },
            "peer" => match rest.as_slice() {
                ["add", address] => match node.add_peer(address.to_string()).await {
                    Ok(()) => println!("connected to {address}"),
                    Err(err) => println!("{err}"),
                },
                ["list"] => {
                    let peers = node.peer_addresses();
                    if peers.is_empty() {
                        println!("no peers");
                    }
                    for address in peers {
                        println!("{address}");
                    }
                }
                _ => println!("usage: peer add <host:port> | peer list"),
            },
            "block" => {
                let hash = match rest.first() {
                    Some(hex_hash) => match hash256_from_hex(hex_hash) {
                        Some(hash) => Some(hash),
                        None => {
                            println!("invalid hash");
                            continue;
                        }
                    },
                    None => None,
                };
                match node.block(hash) {
                    Some(block) => {
                        println!(
                            "block {} height {} difficulty {} txs {}",
                            block.hash_hex(),
                            block.height,
                            block.difficulty,
                            block.txs.len()
                        );
                        if let Some(coinbase) = block.coinbase() {
                            let message = coinbase.coinbase_message();
                            if let Ok(text) = String::from_utf8(message) {
                                println!("data: {text}");
                            }
                        }
                    }
                    None => println!("not found"),
                }
            }
            "blocktxs" => match rest.first().and_then(|hex_hash| hash256_from_hex(hex_hash)) {
                Some(hash) => match node.block_transactions(&hash) {
                    Some(txs) => {
                        for tx in txs {
                            println!("{} ({} sats out)", tx.txid_hex(), tx.output_value());
                        }
                    }
                    None => println!("not found"),
                },
                None => println!("usage: blocktxs <hash>"),
            },
            "tx" => match rest.first().and_then(|hex_id| hash256_from_hex(hex_id)) {
                Some(txid) => match node.transaction(&txid) {
                    Some(tx) => println!(
                        "tx {} inputs {} outputs {} value {}",
                        tx.txid_hex(),
                        tx.inputs.len(),
                        tx.outputs.len(),
                        tx.output_value()
                    ),
                    None => println!("not found"),
                },
                None => println!("usage: tx <txid>"),
            },
            "importprivatekey" => match rest.first() {
                Some(secret_hex) => match node.import_private_key(secret_hex) {
                    Ok(public_hex) => println!("account {public_hex}"),
                    Err(err) => println!("{err}"),
                },
                None => println!("usage: importprivatekey <hex>"),
            },
            other => println!("unknown command '{other}' (try help)"),
        }
    }
}

fn parse_optional_pubkey(
    rest: &[&str],
) -> Result<Option<emberd_primitives::keys::PublicKeyBytes>, String> {
    match rest.first() {
        Some(pubkey_hex) => public_key_from_hex(pubkey_hex)
            .map(Some)
            .map_err(|_| "invalid public key".to_string()),
        None => Ok(None),
    }
}
