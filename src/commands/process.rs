//! Handlers behind the `cmdrelay` subcommands.

use super::parser::Commands;
use crate::attach::OutputStream;
use crate::codec::WireFormat;
use crate::error::RelayError;
use crate::process_record::{display_time, epoch, ProcessId, ProcessState};
use crate::signal::shutdown_signal;
use crate::storage::ProcessStore;
use crate::supervisor::{ProcessSummary, Supervisor};
use anyhow::Result;
use futures::StreamExt;
use std::process::ExitCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub async fn execute<S: ProcessStore>(supervisor: &Supervisor<S>, command: Commands) -> Result<ExitCode> {
    match command {
        Commands::Run {
            label,
            format,
            command,
            args,
        } => {
            let id = supervisor.create_process(&command, &args, &label).await?;
            start_and_follow(supervisor, id, format).await
        }
        Commands::Create {
            label,
            command,
            args,
        } => {
            let id = supervisor.create_process(&command, &args, &label).await?;
            println!("{id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Start { id, format } => start_and_follow(supervisor, id, format).await,
        Commands::Attach { id, after, format } => {
            let stream = supervisor.attach(id, after.unwrap_or_else(epoch)).await?;
            let mut stdout = tokio::io::stdout();
            let last = write_stream(stream, format, &mut stdout).await?;
            if let Some(last) = last {
                eprintln!("cursor: {}", last.timestamp_micros());
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::List { json } => {
            let summaries = supervisor.list_processes().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_table(&summaries);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Kill { id } => {
            supervisor.kill_process(id).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Remove { id } => {
            supervisor.remove_process(id).await?;
            println!("removed {id}");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Sweep => {
            let swept = supervisor.sweep_stale().await?;
            for id in &swept {
                println!("{id}");
            }
            eprintln!("{} stale process(es) marked terminated", swept.len());
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Start `id` and stream its output until it exits. Ctrl-C stops the
/// process and still drains the closing record.
async fn start_and_follow<S: ProcessStore>(
    supervisor: &Supervisor<S>,
    id: ProcessId,
    format: WireFormat,
) -> Result<ExitCode> {
    let started = supervisor.start_process(id).await;
    if let Err(RelayError::SpawnFailure { .. }) = &started {
        // The failure note is in the ledger; show it before the error.
        let stream = supervisor.attach(id, epoch()).await?;
        write_stream(stream, format, &mut tokio::io::stdout()).await?;
    }
    started?;

    let stream = supervisor.attach(id, epoch()).await?;
    let mut stdout = tokio::io::stdout();
    let follow = write_stream(stream, format, &mut stdout);
    tokio::pin!(follow);

    tokio::select! {
        result = &mut follow => {
            result?;
        }
        Ok(()) = shutdown_signal() => {
            supervisor.shutdown().await;
            follow.await?;
        }
    }

    let record = supervisor.get_process(id).await?;
    Ok(match record.state {
        ProcessState::Terminated => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

/// Write every record of `stream` in `format`. Returns the last timestamp
/// written, which is the resume cursor for a later attach.
pub async fn write_stream<W>(
    mut stream: OutputStream,
    format: WireFormat,
    out: &mut W,
) -> Result<Option<chrono::DateTime<chrono::Utc>>>
where
    W: AsyncWrite + Unpin,
{
    let mut last = None;
    while let Some(record) = stream.next().await {
        let record = record?;
        out.write_all(&format.encode(&record)?).await?;
        out.flush().await?;
        last = Some(record.created_at);
    }
    Ok(last)
}

fn print_table(summaries: &[ProcessSummary]) {
    if summaries.is_empty() {
        println!("No processes.");
        return;
    }
    println!(
        "{:<36}  {:<10}  {:<16}  {:<24}  COMMAND",
        "ID", "STATE", "LABEL", "LAST OUTPUT"
    );
    for summary in summaries {
        let last = summary
            .last_output_at
            .map(display_time)
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<10}  {:<16}  {:<24}  {}",
            summary.id,
            summary.state,
            summary.label,
            last,
            summary.command
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::policy::AllowAll;
    use crate::storage::InMemoryStore;

    #[tokio::test]
    async fn test_write_stream_text_and_cursor() {
        let sup = Supervisor::new(InMemoryStore::new(), AllowAll, Settings::default());
        let id = sup.create_process("echo", &["hi".into()], "w").await.unwrap();
        sup.start_process(id).await.unwrap();
        let stream = sup.attach(id, epoch()).await.unwrap();

        let mut out = Vec::new();
        let last = write_stream(stream, WireFormat::Text, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("Command: echo hi\n"));
        assert!(text.contains("\nhi\n"));

        let ledger = sup.store().full_output(id).await.unwrap();
        assert_eq!(last, ledger.last().map(|row| row.created_at));
    }
}
