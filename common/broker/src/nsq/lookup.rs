use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::BrokerError;

#[derive(Debug, Deserialize)]
struct Producer {
    broadcast_address: String,
    tcp_port: u16,
}

#[derive(Debug, Default, Deserialize)]
struct TopicProducers {
    #[serde(default)]
    producers: Vec<Producer>,
}

/// nsqlookupd before 1.0 wraps the payload in a status envelope.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupResponse {
    Wrapped { data: TopicProducers },
    Plain(TopicProducers),
}

impl LookupResponse {
    fn into_producers(self) -> Vec<Producer> {
        match self {
            LookupResponse::Wrapped { data } | LookupResponse::Plain(data) => data.producers,
        }
    }
}

fn lookup_url(lookupd: &str) -> String {
    let base = lookupd.trim_end_matches('/');
    if base.starts_with("http://") || base.starts_with("https://") {
        format!("{base}/lookup")
    } else {
        format!("http://{base}/lookup")
    }
}

/// TCP addresses of the nsqd instances that have `topic`. A topic unknown to
/// nsqlookupd has no producers yet.
pub(crate) async fn lookup(
    client: &reqwest::Client,
    lookupd: &str,
    topic: &str,
) -> Result<Vec<String>, BrokerError> {
    let response = client
        .get(lookup_url(lookupd))
        .query(&[("topic", topic)])
        .header(ACCEPT, "application/vnd.nsq; version=1.0")
        .send()
        .await?;

    if response.status() == StatusCode::NOT_FOUND {
        return Ok(Vec::new());
    }

    let producers = response
        .error_for_status()?
        .json::<LookupResponse>()
        .await?
        .into_producers();

    Ok(producers
        .into_iter()
        .map(|p| format!("{}:{}", p.broadcast_address, p.tcp_port))
        .collect())
}
