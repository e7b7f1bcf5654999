//! Request construction for the statistics archive.

use super::types::Request;
use shared::{Candidate, EndpointKind};

/// Turns a coordinate and endpoint into a concrete request
pub trait RequestBuilder: Send + Sync {
    fn build(&self, candidate: Candidate, endpoint: EndpointKind) -> Request;
}

/// Builds `statistik.do` archive URLs
#[derive(Debug, Clone)]
pub struct StatistikRequestBuilder {
    base_url: String,
}

impl StatistikRequestBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    /// Archive handler name for an endpoint
    pub fn req_code(endpoint: EndpointKind) -> &'static str {
        match endpoint {
            EndpointKind::Standings => "statTeamArchiv",
            EndpointKind::TopScorers => "statBesteWerferArchiv",
            EndpointKind::FreeThrows => "statBesteFreiWerferArchiv",
            EndpointKind::ThreePointers => "statBeste3erWerferArchiv",
        }
    }
}

impl RequestBuilder for StatistikRequestBuilder {
    fn build(&self, candidate: Candidate, endpoint: EndpointKind) -> Request {
        let mut url = format!(
            "{}/statistik.do?reqCode={}&liga_id={}&saison_id={}",
            self.base_url,
            Self::req_code(endpoint),
            candidate.candidate_id,
            candidate.period
        );
        // Player lists are truncated to the top entries unless asked for all
        if endpoint != EndpointKind::Standings {
            url.push_str("&_top=-1");
        }
        Request::get(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Period;

    #[test]
    fn test_build_urls() {
        let builder = StatistikRequestBuilder::new("https://www.basketball-bund.net/");
        let candidate = Candidate::new(26212, Period(2018));

        assert_eq!(
            builder.build(candidate, EndpointKind::Standings).url,
            "https://www.basketball-bund.net/statistik.do?reqCode=statTeamArchiv&liga_id=26212&saison_id=2018"
        );
        assert_eq!(
            builder.build(candidate, EndpointKind::FreeThrows).url,
            "https://www.basketball-bund.net/statistik.do?reqCode=statBesteFreiWerferArchiv&liga_id=26212&saison_id=2018&_top=-1"
        );
    }
}
