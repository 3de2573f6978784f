use crate::error::MonitorError;
use crate::types::{ApiResponse, PollState, Study};

/// Pick the study with the highest reward.
///
/// Ties keep the first one seen. Returns `None` for an empty slice.
pub fn select_best_study(studies: &[Study]) -> Option<&Study> {
    let mut best: Option<&Study> = None;
    for study in studies {
        match best {
            Some(b) if study.reward <= b.reward => {}
            _ => best = Some(study),
        }
    }
    best
}

/// What a listing fetch means for the state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingOutcome {
    pub state: PollState,
    /// Present for every state other than `Ok`.
    pub error: Option<MonitorError>,
    /// Wipe the published collection before anything else.
    pub clear_results: bool,
    /// Collection to run through the study update step.
    pub results: Option<Vec<Study>>,
}

/// Classify a listing response.
///
/// Results carried by the response are always propagated, whatever the
/// error classification.
pub fn classify_listing(response: Result<ApiResponse<Study>, MonitorError>) -> ListingOutcome {
    let response = match response {
        Ok(r) => r,
        Err(e) if e.is_auth() => {
            return ListingOutcome {
                state: PollState::AuthError,
                error: Some(e),
                clear_results: true,
                results: None,
            };
        }
        Err(e) => {
            return ListingOutcome {
                state: PollState::MarketplaceError,
                error: Some(e),
                clear_results: true,
                results: None,
            };
        }
    };

    match response.error {
        Some(err) if err.is_auth() => ListingOutcome {
            state: PollState::AuthError,
            // Listings fetched under an expired credential are not claimable.
            clear_results: response.results.is_none(),
            error: Some(err.into_error()),
            results: response.results,
        },
        Some(err) => ListingOutcome {
            state: PollState::MarketplaceError,
            error: Some(err.into_error()),
            clear_results: true,
            results: response.results,
        },
        None => ListingOutcome {
            state: PollState::Ok,
            error: None,
            clear_results: false,
            results: response.results,
        },
    }
}
