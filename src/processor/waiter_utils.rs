//! Translation of responses into results.

use crate::error::{Error, Result};
use crate::wire::{Response, ResponsePayload, ResultCode};

/// Turn a response into the payload of a successful call.
///
/// Retry and inaccessible responses become [`Error::Retry`], timed out
/// responses become [`Error::Timeout`], other error responses become
/// [`Error::Remote`], and a successful response reporting keys that were
/// not subscribed becomes [`Error::NotSubscribed`].
pub fn into_result(response: Response) -> Result<ResponsePayload> {
    match response.code {
        ResultCode::Success => match response.payload {
            ResponsePayload::NotSubscribed { subscriber, keys } => {
                Err(Error::NotSubscribed { subscriber, keys })
            }
            payload => Ok(payload),
        },
        ResultCode::Retry | ResultCode::Inaccessible => Err(Error::retry(reason(&response))),
        ResultCode::Error if response.payload == ResponsePayload::TimedOut => Err(Error::Timeout),
        ResultCode::Error => Err(Error::Remote(reason(&response))),
    }
}

fn reason(response: &Response) -> String {
    match &response.payload {
        ResponsePayload::Error(message) | ResponsePayload::Retry(message) => message.clone(),
        other => format!("{:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Binary;
    use crate::wire::LockResult;
    use uuid::Uuid;

    #[test]
    fn test_codes() {
        let id = Uuid::new_v4();

        let payload = into_result(Response::success(id, ResponsePayload::Lock(LockResult::Granted)));
        assert_eq!(payload.unwrap(), ResponsePayload::Lock(LockResult::Granted));

        assert!(into_result(Response::retry(id, "moving")).unwrap_err().is_retryable());
        assert!(into_result(Response::inaccessible(id, "down")).unwrap_err().is_retryable());
        let timed_out = into_result(Response::timed_out(id)).unwrap_err();
        assert!(matches!(timed_out, Error::Timeout));
        assert!(!timed_out.is_retryable());
        assert!(matches!(
            into_result(Response::error(id, "bad")),
            Err(Error::Remote(msg)) if msg == "bad"
        ));
    }

    #[test]
    fn test_not_subscribed() {
        let id = Uuid::new_v4();
        let keys = vec![Binary::from_static(b"x")];
        let response = Response::success(
            id,
            ResponsePayload::NotSubscribed {
                subscriber: 3,
                keys: keys.clone(),
            },
        );
        match into_result(response) {
            Err(Error::NotSubscribed { subscriber, keys: missing }) => {
                assert_eq!(subscriber, 3);
                assert_eq!(missing, keys);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
