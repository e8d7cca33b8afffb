//! Client for the checkout driver sidecar.
//!
//! The driver owns the browser automation for the payment websites. We talk to it over a small JSON/HTTP protocol:
//!
//! * `POST /sessions {orderId}` opens a checkout session and answers `{sessionId}`.
//! * `POST /sessions/{id}/payment` submits the payment. The response is newline-delimited JSON: any number of
//!   `{"progress": n}` lines followed by exactly one `{"result": {...}}` or `{"error": "..."}` line.
//! * `POST /sessions/{id}/otp {otp}` answers the checkout fields for the second verification step.
//! * `DELETE /sessions/{id}` closes the session.
//! * `POST /watch {url, marker, timeoutSecs}` answers 200 once the marker text is visible on the page.
//! * `POST /shutdown` releases the driver's shared browser.
use std::time::Duration;

use async_trait::async_trait;
use cb_common::Amount;
use checkout_bridge_engine::{
    db_types::{Order, OrderId, PaymentMethod},
    traits::{
        CheckoutSession,
        OtpSubmission,
        PageWatcher,
        PaymentProvider,
        PaymentProviderError,
        PaymentSubmission,
        ProgressFn,
        VerifierError,
    },
};
use futures::StreamExt;
use log::*;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

/// Extra time the driver is given on top of our own deadline, so that our timeout always fires first.
const WATCH_MARGIN: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on any single driver call, including reading a streamed payment response.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

//--------------------------------------    Wire objects     ---------------------------------------------------------
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionRequest<'a> {
    order_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSessionResponse {
    session_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentRequest<'a> {
    order_id: &'a str,
    user_id: &'a str,
    payment_type: &'a PaymentMethod,
    phone_number: &'a str,
    amount: &'a Amount,
}

#[derive(Serialize)]
struct OtpRequest<'a> {
    otp: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchRequest<'a> {
    url: &'a str,
    marker: &'a str,
    timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutFields {
    #[serde(default)]
    redirect_url: String,
    #[serde(default)]
    qr_payload: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    order_id: String,
}

/// One line of the payment stream. Exactly one of the fields is expected to be set.
#[derive(Debug, Default, Deserialize)]
struct PaymentStreamLine {
    #[serde(default)]
    progress: Option<u32>,
    #[serde(default)]
    result: Option<CheckoutFields>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum StreamItem {
    Progress(u32),
    Done(PaymentSubmission),
    Failed(String),
}

fn parse_stream_line(line: &[u8]) -> Result<Option<StreamItem>, PaymentProviderError> {
    if line.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let parsed = serde_json::from_slice::<PaymentStreamLine>(line)
        .map_err(|e| PaymentProviderError::Submission(format!("Unreadable payment stream line. {e}")))?;
    let item = match parsed {
        PaymentStreamLine { error: Some(e), .. } => StreamItem::Failed(e),
        PaymentStreamLine { result: Some(fields), .. } => StreamItem::Done(PaymentSubmission {
            redirect_url: fields.redirect_url,
            qr_payload: fields.qr_payload,
            message: fields.message,
            external_order_id: fields.order_id,
        }),
        PaymentStreamLine { progress: Some(p), .. } => StreamItem::Progress(p),
        _ => return Ok(None),
    };
    Ok(Some(item))
}

/// Removes every complete line from the front of `buffer`.
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let mut line: Vec<u8> = buffer.drain(..=pos).collect();
        line.pop();
        lines.push(line);
    }
    lines
}

async fn error_text(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}. {body}")
    }
}

fn build_client(timeout: Duration) -> Result<Client, PaymentProviderError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(timeout)
        .build()
        .map_err(|e| PaymentProviderError::Transport(e.to_string()))
}

//--------------------------------------   CheckoutDriver    ---------------------------------------------------------
/// The checkout driver as a [`PaymentProvider`] and a [`PageWatcher`].
#[derive(Clone)]
pub struct CheckoutDriver {
    base_url: String,
    name: String,
    client: Client,
    watch_timeout: Duration,
}

impl CheckoutDriver {
    pub fn new<S: Into<String>>(base_url: S, name: S) -> Result<Self, PaymentProviderError> {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let client = build_client(DEFAULT_REQUEST_TIMEOUT)?;
        Ok(Self { base_url, name: name.into(), client, watch_timeout: Duration::from_secs(30) + WATCH_MARGIN })
    }

    /// Gives up on any session, payment or OTP call that takes longer than `timeout`. Watch calls use the watch
    /// timeout instead.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Result<Self, PaymentProviderError> {
        self.client = build_client(timeout)?;
        Ok(self)
    }

    /// How long the driver should keep looking for a marker before giving up on its side.
    pub fn with_watch_timeout(mut self, timeout: Duration) -> Self {
        self.watch_timeout = timeout + WATCH_MARGIN;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl PaymentProvider for CheckoutDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn new_payment(&self, order_id: &OrderId) -> Result<Box<dyn CheckoutSession>, PaymentProviderError> {
        let response = self
            .client
            .post(self.url("sessions"))
            .json(&NewSessionRequest { order_id: order_id.as_str() })
            .send()
            .await
            .map_err(|e| PaymentProviderError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PaymentProviderError::SessionCreation(error_text(response).await));
        }
        let NewSessionResponse { session_id } =
            response.json().await.map_err(|e| PaymentProviderError::SessionCreation(e.to_string()))?;
        debug!("🌐️ Checkout session {session_id} opened for order [{order_id}]");
        let session = DriverSession {
            session_url: self.url(&format!("sessions/{session_id}")),
            session_id,
            client: self.client.clone(),
        };
        Ok(Box::new(session))
    }

    async fn close(&self) {
        match self.client.post(self.url("shutdown")).send().await {
            Ok(r) if r.status().is_success() => info!("🌐️ Checkout driver shut down"),
            Ok(r) => warn!("🌐️ Checkout driver refused to shut down. {}", error_text(r).await),
            Err(e) => warn!("🌐️ Could not reach the checkout driver to shut it down. {e}"),
        }
    }
}

#[async_trait]
impl PageWatcher for CheckoutDriver {
    async fn wait_for_marker(&self, url: &str, marker: &str) -> Result<(), VerifierError> {
        let request = WatchRequest { url, marker, timeout_secs: self.watch_timeout.as_secs() };
        let response = self
            .client
            .post(self.url("watch"))
            .timeout(self.watch_timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| VerifierError::Transport(e.to_string()))?;
        if response.status().is_success() {
            trace!("🌐️ '{marker}' is visible on {url}");
            Ok(())
        } else {
            Err(VerifierError::Watcher(format!("'{marker}' was not seen on {url}. {}", error_text(response).await)))
        }
    }
}

//--------------------------------------    DriverSession    ---------------------------------------------------------
struct DriverSession {
    session_id: String,
    session_url: String,
    client: Client,
}

#[async_trait]
impl CheckoutSession for DriverSession {
    async fn submit_payment(
        &self,
        order: &Order,
        on_progress: ProgressFn<'_>,
    ) -> Result<PaymentSubmission, PaymentProviderError> {
        let request = PaymentRequest {
            order_id: order.id.as_str(),
            user_id: &order.user_id,
            payment_type: &order.payment_type,
            phone_number: &order.phone_number,
            amount: &order.amount,
        };
        let response = self
            .client
            .post(format!("{}/payment", self.session_url))
            .json(&request)
            .send()
            .await
            .map_err(|e| PaymentProviderError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PaymentProviderError::Submission(error_text(response).await));
        }
        let mut body = response.bytes_stream();
        let mut buffer = Vec::new();
        loop {
            let (lines, finished) = match body.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| PaymentProviderError::Submission(e.to_string()))?;
                    buffer.extend_from_slice(&chunk);
                    (drain_lines(&mut buffer), false)
                },
                // A final line without a trailing newline still counts
                None => (vec![std::mem::take(&mut buffer)], true),
            };
            for line in lines {
                match parse_stream_line(&line)? {
                    Some(StreamItem::Progress(p)) => {
                        trace!("🌐️ Session {} reports {p}% progress", self.session_id);
                        on_progress(p);
                    },
                    Some(StreamItem::Done(submission)) => return Ok(submission),
                    Some(StreamItem::Failed(reason)) => return Err(PaymentProviderError::Submission(reason)),
                    None => {},
                }
            }
            if finished {
                return Err(PaymentProviderError::Submission(
                    "The checkout driver closed the payment stream without a result".into(),
                ));
            }
        }
    }

    async fn submit_otp(&self, otp: &str) -> Result<OtpSubmission, PaymentProviderError> {
        let response = self
            .client
            .post(format!("{}/otp", self.session_url))
            .json(&OtpRequest { otp })
            .send()
            .await
            .map_err(|e| PaymentProviderError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(PaymentProviderError::Otp(error_text(response).await));
        }
        let fields: CheckoutFields = response.json().await.map_err(|e| PaymentProviderError::Otp(e.to_string()))?;
        Ok(OtpSubmission { redirect_url: fields.redirect_url, qr_payload: fields.qr_payload, message: fields.message })
    }

    async fn close(&self) {
        match self.client.delete(&self.session_url).send().await {
            Ok(r) if r.status().is_success() => debug!("🌐️ Checkout session {} closed", self.session_id),
            Ok(r) => warn!("🌐️ Checkout session {} did not close cleanly. {}", self.session_id, error_text(r).await),
            Err(e) => warn!("🌐️ Could not close checkout session {}. {e}", self.session_id),
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use mockito::{Matcher, Server};
    use serde_json::json;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    fn order() -> Order {
        Order::new("ord_1".into(), "alice", Amount::from(100))
            .with_payment_type(PaymentMethod::PromptPay)
            .with_phone_number("0812345678")
    }

    #[test]
    fn stream_lines() {
        assert_eq!(parse_stream_line(b"{\"progress\":30}").unwrap(), Some(StreamItem::Progress(30)));
        assert_eq!(parse_stream_line(b"  ").unwrap(), None);
        let failed = parse_stream_line(b"{\"error\":\"card declined\"}").unwrap();
        assert_eq!(failed, Some(StreamItem::Failed("card declined".into())));
        let line = br#"{"result":{"redirectUrl":"https://pay/1","qrPayload":"000201","orderId":"X1"}}"#;
        let done = parse_stream_line(line);
        match done.unwrap() {
            Some(StreamItem::Done(s)) => {
                assert_eq!(s.redirect_url, "https://pay/1");
                assert_eq!(s.qr_payload, "000201");
                assert_eq!(s.external_order_id, "X1");
                assert!(s.message.is_empty());
            },
            other => panic!("Expected a result, got {other:?}"),
        }
        assert!(parse_stream_line(b"{not json").is_err());
    }

    #[test]
    fn lines_are_split_across_chunks() {
        let mut buffer = b"{\"progress\":10}\n{\"prog".to_vec();
        let lines = drain_lines(&mut buffer);
        assert_eq!(lines, vec![b"{\"progress\":10}".to_vec()]);
        assert_eq!(buffer, b"{\"prog".to_vec());
        buffer.extend_from_slice(b"ress\":20}\n");
        assert_eq!(drain_lines(&mut buffer), vec![b"{\"progress\":20}".to_vec()]);
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn full_payment_over_http() {
        let mut server = Server::new_async().await;
        let open = server
            .mock("POST", "/sessions")
            .match_body(Matcher::PartialJson(json!({"orderId": "ord_1"})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sessionId":"s1"}"#)
            .create_async()
            .await;
        let pay = server
            .mock("POST", "/sessions/s1/payment")
            .match_body(Matcher::PartialJson(json!({"paymentType": "promptpay", "phoneNumber": "0812345678"})))
            .with_status(200)
            .with_body(concat!(
                "{\"progress\":20}\n",
                "{\"progress\":60}\n",
                r#"{"result":{"redirectUrl":"https://pay/s1","qrPayload":"000201","#,
                r#""message":"Scan to pay","orderId":"EXT-9"}}"#,
            ))
            .create_async()
            .await;
        let close = server.mock("DELETE", "/sessions/s1").with_status(204).create_async().await;

        let driver = CheckoutDriver::new(server.url(), "driver".to_string()).unwrap();
        let session = driver.new_payment(&"ord_1".into()).await.unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_2 = seen.clone();
        let record = move |p: u32| seen_2.lock().unwrap().push(p);
        let submission = session.submit_payment(&order(), &record).await.unwrap();
        session.close().await;

        assert_eq!(*seen.lock().unwrap(), vec![20, 60]);
        assert_eq!(submission.redirect_url, "https://pay/s1");
        assert_eq!(submission.external_order_id, "EXT-9");
        assert_eq!(submission.message, "Scan to pay");
        open.assert_async().await;
        pay.assert_async().await;
        close.assert_async().await;
    }

    #[tokio::test]
    async fn driver_errors_become_provider_errors() {
        let mut server = Server::new_async().await;
        let _refused =
            server.mock("POST", "/sessions").with_status(503).with_body("browser busy").create_async().await;
        let driver = CheckoutDriver::new(server.url(), "driver".to_string()).unwrap();
        let err = driver.new_payment(&"ord_1".into()).await.err().unwrap();
        assert!(matches!(err, PaymentProviderError::SessionCreation(ref s) if s.contains("browser busy")));

        let _s2 = server
            .mock("POST", "/sessions/s2/payment")
            .with_status(200)
            .with_body("{\"progress\":10}\n{\"error\":\"Phone number not registered\"}\n")
            .create_async()
            .await;
        let session = DriverSession {
            session_id: "s2".into(),
            session_url: format!("{}/sessions/s2", server.url()),
            client: Client::new(),
        };
        let err = session.submit_payment(&order(), &|_: u32| {}).await.unwrap_err();
        assert_eq!(err.to_string(), "Payment submission failed. Phone number not registered");

        let _s3 = server
            .mock("POST", "/sessions/s3/payment")
            .with_status(200)
            .with_body("{\"progress\":10}\n")
            .create_async()
            .await;
        let session = DriverSession {
            session_id: "s3".into(),
            session_url: format!("{}/sessions/s3", server.url()),
            client: Client::new(),
        };
        let err = session.submit_payment(&order(), &|_: u32| {}).await.unwrap_err();
        assert!(err.to_string().contains("without a result"));
    }

    /// Accepts connections and then never answers, unless `preamble` is given, in which case it is written once and
    /// the connection is left hanging.
    async fn stalled_driver(preamble: Option<&'static [u8]>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((mut socket, _)) = listener.accept().await {
                if let Some(bytes) = preamble {
                    let mut request = [0u8; 4096];
                    let _ = socket.read(&mut request).await;
                    let _ = socket.write_all(bytes).await;
                }
                held.push(socket);
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn stalled_session_requests_time_out() {
        let url = stalled_driver(None).await;
        let driver = CheckoutDriver::new(url, "driver".to_string())
            .unwrap()
            .with_request_timeout(Duration::from_millis(300))
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(10), driver.new_payment(&"ord_1".into()))
            .await
            .expect("The driver call should give up on its own");
        assert!(matches!(result.err(), Some(PaymentProviderError::Transport(_))));
    }

    #[tokio::test]
    async fn stalled_payment_streams_time_out() {
        let preamble: &'static [u8] =
            b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n10\r\n{\"progress\":10}\n\r\n";
        let url = stalled_driver(Some(preamble)).await;
        let driver = CheckoutDriver::new(url.clone(), "driver".to_string())
            .unwrap()
            .with_request_timeout(Duration::from_millis(500))
            .unwrap();
        let session =
            DriverSession { session_id: "s1".into(), session_url: format!("{url}/sessions/s1"), client: driver.client };
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_2 = seen.clone();
        let record = move |p: u32| seen_2.lock().unwrap().push(p);
        let result = tokio::time::timeout(Duration::from_secs(10), session.submit_payment(&order(), &record))
            .await
            .expect("The payment stream should give up on its own");
        assert!(result.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![10]);
    }

    #[tokio::test]
    async fn otp_and_watch() {
        let mut server = Server::new_async().await;
        let _otp = server
            .mock("POST", "/sessions/s1/otp")
            .match_body(Matcher::Json(json!({"otp": "123456"})))
            .with_status(200)
            .with_body(r#"{"redirectUrl":"https://pay/otp","qrPayload":"qr2","message":"Confirmed"}"#)
            .create_async()
            .await;
        let _seen = server
            .mock("POST", "/watch")
            .match_body(Matcher::PartialJson(json!({"marker": "Payment Complete!", "timeoutSecs": 15})))
            .with_status(200)
            .create_async()
            .await;
        let _unseen = server
            .mock("POST", "/watch")
            .match_body(Matcher::PartialJson(json!({"marker": "Payment Failed!"})))
            .with_status(408)
            .create_async()
            .await;
        let session = DriverSession {
            session_id: "s1".into(),
            session_url: format!("{}/sessions/s1", server.url()),
            client: Client::new(),
        };
        let otp = session.submit_otp("123456").await.unwrap();
        assert_eq!(otp.redirect_url, "https://pay/otp");
        assert_eq!(otp.qr_payload, "qr2");

        let driver = CheckoutDriver::new(server.url(), "driver".to_string())
            .unwrap()
            .with_watch_timeout(Duration::from_secs(10));
        driver.wait_for_marker("https://pay/otp", "Payment Complete!").await.unwrap();
        let err = driver.wait_for_marker("https://pay/otp", "Payment Failed!").await.unwrap_err();
        assert!(matches!(err, VerifierError::Watcher(_)));
    }
}
