use bytes::{BufMut, BytesMut};
use log::warn;

use crate::errors::Error;
use crate::messages::constants::CANCEL_REQUEST_CODE;
use crate::messages::write_all_flush;
use crate::router::CancelTarget;

use super::stream::connect_stream;

/// Issue a query cancellation request to the upstream server. Uses a
/// separate short-lived connection that is not part of any pool.
pub(crate) async fn cancel(target: &CancelTarget) -> Result<(), Error> {
    let mut stream = connect_stream(&target.host, target.port).await?;

    warn!(
        "Sending CancelRequest to [{}] {}:{}",
        target.process_id, target.host, target.port
    );

    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(target.process_id);
    bytes.put_i32(target.secret_key);

    write_all_flush(&mut stream, &bytes).await
}
