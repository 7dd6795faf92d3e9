//! Newline-delimited JSON framing for [`Message`]s

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::TransportError;
use crate::models::Message;

pub fn encode(message: &Message) -> Result<String, TransportError> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode(line: &str) -> Result<Message, TransportError> {
    Ok(serde_json::from_str(line)?)
}

/// Write one message as a single line and flush it
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = encode(message)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read the next message; `Ok(None)` on end of stream. Blank lines are skipped.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, TransportError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return decode(trimmed).map(Some);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionCompletePayload, ExecutionState};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn test_stream_framing() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &Message::Register(ExecutionState::default()))
            .await
            .unwrap();
        buffer.extend_from_slice(b"\n");
        write_message(
            &mut buffer,
            &Message::ExecutionComplete(ExecutionCompletePayload::done()),
        )
        .await
        .unwrap();

        let mut reader = BufReader::new(buffer.as_slice());
        assert!(matches!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::Register(_))
        ));
        assert!(matches!(
            read_message(&mut reader).await.unwrap(),
            Some(Message::ExecutionComplete(_))
        ));
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_line() {
        let mut reader = BufReader::new(&b"{\"type\": \"nope\"}\n"[..]);
        assert!(matches!(
            read_message(&mut reader).await,
            Err(TransportError::Codec(_))
        ));
    }
}
