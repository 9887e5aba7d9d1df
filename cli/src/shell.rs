//! Interactive command loop over a running sandbox

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use num_bigint::BigUint;
use tally_config::TallyConfig;
use tally_core::orchestrator::{FixedSecret, Participant, Sandbox};
use tally_core::{AskerHandle, QueryOutcome};
use tokio::io::{AsyncBufReadExt, BufReader};

const CLI_IDENTITY: &str = "cli";

pub async fn run(config: TallyConfig) -> Result<()> {
    let sandbox = Sandbox::launch(config)?;
    let asker = sandbox.asker().clone();
    let manual = sandbox.participant(CLI_IDENTITY, Arc::new(FixedSecret(BigUint::default())));

    // results arrive whenever a query finishes
    let mut outcomes = asker.outcomes();
    tokio::spawn(async move {
        while let Ok(outcome) = outcomes.recv().await {
            println!("{}", describe(&outcome));
        }
    });

    print_help();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&cmd, rest)) = words.split_first() else {
            continue;
        };
        match cmd {
            "exit" | "quit" => break,
            "help" => print_help(),
            _ => match dispatch(cmd, rest, &asker, &manual).await {
                Ok(message) => println!("{message}"),
                Err(e) => println!("error: {e:#}"),
            },
        }
    }

    log::info!("shutting down sandbox");
    sandbox.shutdown().await;
    Ok(())
}

async fn dispatch(
    cmd: &str,
    rest: &[&str],
    asker: &AskerHandle,
    manual: &Participant,
) -> Result<String> {
    match cmd {
        "start" => Ok(format!("started {}", asker.start().await?)),
        "add" => {
            let [id, value] = rest else {
                bail!("usage: add <id> <value>");
            };
            let secret: BigUint = value
                .parse()
                .with_context(|| format!("bad value {value}"))?;
            let participants = manual.contribute(id, &secret).await?;
            Ok(format!("{id}: {participants} participants"))
        }
        "close" => Ok(describe(&asker.close(single_id(rest)?).await?)),
        "retrieve" => Ok(describe(&asker.retrieve(single_id(rest)?).await?)),
        "remove" => {
            let id = single_id(rest)?;
            asker.remove(id).await?;
            Ok(format!("removed {id}"))
        }
        "exists" => {
            let id = single_id(rest)?;
            Ok(format!("{id}: {}", asker.exists(id).await?))
        }
        _ => bail!("unknown command {cmd}"),
    }
}

fn single_id<'a>(rest: &[&'a str]) -> Result<&'a str> {
    match rest {
        [id] => Ok(*id),
        _ => bail!("expected exactly one query id"),
    }
}

fn describe(outcome: &QueryOutcome) -> String {
    let mut line = format!(
        "{} [{}] participants={}",
        outcome.id, outcome.state, outcome.participants
    );
    match &outcome.sum {
        Some(Ok(sum)) => line.push_str(&format!(" sum={sum}")),
        Some(Err(e)) => line.push_str(&format!(" unmask failed: {e}")),
        None => {}
    }
    if outcome.inconsistent {
        line.push_str(" (operators disagreed)");
    }
    line
}

fn print_help() {
    println!("commands: start | add <id> <value> | close <id> | retrieve <id> | remove <id> | exists <id> | exit");
}
