//! Turns a sequential reader over one torrent file into piece events.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::{SwarmError, SwarmEvent};

/// Reads `size` bytes from `reader` and sends them as `piece_length` pieces.
///
/// Piece `i` covers `[i * piece_length, (i + 1) * piece_length)` of the file;
/// the last one may be short. A read error is forwarded as
/// `SwarmEvent::Error` and ends the feed. Returns early when `cancel` fires
/// or the receiver is gone.
pub async fn feed_pieces<R>(
    mut reader: R,
    size: u64,
    piece_length: u32,
    sender: mpsc::Sender<SwarmEvent>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let piece_length = u64::from(piece_length);
    if piece_length == 0 {
        let _ = sender.send(SwarmEvent::Error(SwarmError::EngineClosed)).await;
        return;
    }

    let mut offset = 0u64;
    let mut piece_index = 0u32;
    while offset < size {
        let len = piece_length.min(size - offset) as usize;
        let mut buf = BytesMut::zeroed(len);

        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_exact(&mut buf) => read,
        };
        let event = match read {
            Ok(_) => {
                trace!(piece_index, offset, "Piece read");
                SwarmEvent::PieceReady {
                    piece_index,
                    data: buf.freeze(),
                }
            }
            Err(e) => {
                warn!(piece_index, offset, "Piece read failed: {e}");
                let _ = sender.send(SwarmEvent::Error(SwarmError::Io(e))).await;
                return;
            }
        };
        if sender.send(event).await.is_err() {
            return;
        }

        offset += len as u64;
        piece_index += 1;
    }
    debug!(size, pieces = piece_index, "File fully read");
}
