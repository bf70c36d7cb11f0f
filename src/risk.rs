//! Pre-checks before an order request leaves the client.

use crate::controller::AppState;
use crate::error::{ClientError, ClientResult};
use crate::types::{OrderRequest, QtySpec, Side};

pub struct OrderGuard;

impl OrderGuard {
    pub fn pre_check(req: &OrderRequest, state: &AppState) -> ClientResult<()> {
        if state.loading {
            return Err(ClientError::validation("another order is still in flight"));
        }
        if req.qty == QtySpec::Count(0) {
            return Err(ClientError::validation("quantity must be at least 1"));
        }
        if req.side == Side::Sell && !*state.open_legs.get(req.option) {
            return Err(ClientError::validation(format!(
                "no open {} position on {} to sell",
                req.option, req.tk
            )));
        }
        Ok(())
    }
}
