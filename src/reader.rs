use crate::error::{DropCode, Error};
use crate::frame::{create_header, OpCode, STATUS_NORMAL_CLOSURE};
use crate::handler::MuxHandler;
use crate::physical::PhysicalRead;
use log::{debug, warn};
use std::sync::Arc;

/// The single task owning the read side of the physical connection. Frames
/// are handed to the multiplexing handler; whatever ends this loop, every
/// logical channel is moved to Terminated on the way out so no worker stays
/// suspended on a dead connection.
pub(crate) async fn run_reader(handler: Arc<MuxHandler>, mut source: Box<dyn PhysicalRead>) {
    loop {
        let frame = match source.receive_frame().await {
            Ok(frame) => frame,
            Err(Error::ConnectionTerminated) => {
                debug!("physical connection terminated");
                break;
            }
            Err(err) => {
                // Anything unexpected shuts the physical connection down;
                // crashing the process is never an option here.
                warn!("error while reading from the physical connection: {}", err);
                break;
            }
        };

        match frame.opcode {
            OpCode::Binary => {
                if let Err(err) = handler.dispatch_frame(frame).await {
                    handler.fail_physical_connection(&err).await;
                    break;
                }
            }
            OpCode::Ping => {
                let mut pong = create_header(
                    true,
                    false,
                    false,
                    false,
                    OpCode::Pong.as_u8(),
                    frame.payload.len(),
                );
                pong.extend_from_slice(&frame.payload);
                let _ = handler.send_control_data(pong).await;
            }
            OpCode::Pong => {
                // absorb
            }
            OpCode::Close => {
                let _ = handler
                    .send_close_frame(STATUS_NORMAL_CLOSURE)
                    .await;
                break;
            }
            OpCode::Text | OpCode::Continue => {
                let err = Error::physical(
                    DropCode::InvalidEncapsulatingMessage,
                    0,
                    "multiplexed frames must be binary",
                );
                handler.fail_physical_connection(&err).await;
                break;
            }
        }
    }

    handler.notify_reader_done().await;
}
