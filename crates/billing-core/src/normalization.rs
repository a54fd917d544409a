use crate::{
    error::{BillingError, BillingErrorCategory},
    types::{
        BillingEvent, BillingResult, PendingPurchase, ProductDetails, Purchase, PurchaseState,
    },
};

/// What to do with one purchase from a purchase update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurchaseDisposition {
    /// Completed but unacknowledged; acknowledge `purchase_token` before resolving.
    Acknowledge { purchase_token: String },
    /// Completed and already acknowledged; resolve as success.
    AlreadyAcknowledged,
    /// Not completed; resolve as failure.
    NotCompleted { state: PurchaseState },
}

pub fn purchase_disposition(purchase: &PendingPurchase) -> PurchaseDisposition {
    match purchase.state {
        PurchaseState::Purchased if !purchase.acknowledged => PurchaseDisposition::Acknowledge {
            purchase_token: purchase.purchase_token.clone(),
        },
        PurchaseState::Purchased => PurchaseDisposition::AlreadyAcknowledged,
        state => PurchaseDisposition::NotCompleted { state },
    }
}

/// Validate a purchase update and return the purchases to handle in order.
///
/// A non-OK status, a missing list, or an empty list is a failed update.
pub fn normalize_purchase_update(
    result: &BillingResult,
    purchases: Option<Vec<Purchase>>,
) -> Result<Vec<Purchase>, BillingError> {
    if !result.is_ok() {
        return Err(BillingError::from_billing_result(
            BillingErrorCategory::PurchaseLaunch,
            "purchase_update_failed",
            result,
        ));
    }

    match purchases {
        Some(purchases) if !purchases.is_empty() => Ok(purchases),
        _ => Err(BillingError::new(
            BillingErrorCategory::PurchaseLaunch,
            "purchase_update_empty",
            "purchase update carried no purchases",
        )),
    }
}

/// Keep only the first product of a catalog response.
pub fn first_product(products: Vec<ProductDetails>) -> Option<ProductDetails> {
    products.into_iter().next()
}

/// Find the first owned purchase that covers `product_id`.
pub fn find_owned_purchase<'a>(
    purchases: &'a [Purchase],
    product_id: &str,
) -> Option<&'a Purchase> {
    purchases
        .iter()
        .find(|purchase| purchase.contains_product(product_id))
}

/// Convert a failed operation into an `OperationFailed` event.
pub fn normalize_operation_failure(operation: &str, error: &BillingError) -> BillingEvent {
    BillingEvent::OperationFailed {
        operation: operation.to_owned(),
        code: error.code.clone(),
        response_code: error.response_code,
        recoverable: error.is_recoverable(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BillingResponseCode;

    #[test]
    fn unacknowledged_purchase_needs_acknowledgement() {
        let purchase = Purchase::purchased("tok-1", "premium");
        assert_eq!(
            purchase_disposition(&PendingPurchase::from(&purchase)),
            PurchaseDisposition::Acknowledge {
                purchase_token: "tok-1".into()
            }
        );
    }

    #[test]
    fn acknowledged_and_incomplete_purchases_resolve_directly() {
        let acknowledged = Purchase::purchased("tok-1", "premium").with_acknowledged(true);
        assert_eq!(
            purchase_disposition(&PendingPurchase::from(&acknowledged)),
            PurchaseDisposition::AlreadyAcknowledged
        );

        let pending = Purchase::purchased("tok-2", "premium").with_state(PurchaseState::Pending);
        assert_eq!(
            purchase_disposition(&PendingPurchase::from(&pending)),
            PurchaseDisposition::NotCompleted {
                state: PurchaseState::Pending
            }
        );
    }

    #[test]
    fn failed_or_empty_updates_are_rejected() {
        let err = normalize_purchase_update(
            &BillingResult::new(BillingResponseCode::UserCanceled, "user backed out"),
            Some(vec![Purchase::purchased("tok", "premium")]),
        )
        .expect_err("non-OK update must fail");
        assert_eq!(err.code, "purchase_update_failed");
        assert_eq!(err.response_code, Some(BillingResponseCode::UserCanceled));

        let err = normalize_purchase_update(&BillingResult::ok(), None)
            .expect_err("missing list must fail");
        assert_eq!(err.code, "purchase_update_empty");

        let err = normalize_purchase_update(&BillingResult::ok(), Some(Vec::new()))
            .expect_err("empty list must fail");
        assert_eq!(err.code, "purchase_update_empty");
    }

    #[test]
    fn keeps_only_first_catalog_product() {
        let a = ProductDetails::in_app("a", "A", "$1.00");
        let b = ProductDetails::in_app("b", "B", "$2.00");
        assert_eq!(first_product(vec![a.clone(), b]), Some(a));
        assert_eq!(first_product(Vec::new()), None);
    }

    #[test]
    fn finds_owned_purchase_by_product_set() {
        let mut bundle = Purchase::purchased("tok-bundle", "coins");
        bundle.products.push("p1".into());
        let purchases = vec![Purchase::purchased("tok-other", "p2"), bundle];

        let found = find_owned_purchase(&purchases, "p1").expect("p1 should be owned");
        assert_eq!(found.purchase_token, "tok-bundle");
        assert!(find_owned_purchase(&purchases, "p3").is_none());
        assert!(find_owned_purchase(&[], "p1").is_none());
    }

    #[test]
    fn maps_failure_to_operation_event_with_stable_code() {
        let event = normalize_operation_failure(
            "consume",
            &BillingError::from_billing_result(
                BillingErrorCategory::Consume,
                "consume_failed",
                &BillingResponseCode::NetworkError.into(),
            ),
        );

        match event {
            BillingEvent::OperationFailed {
                operation,
                code,
                response_code,
                recoverable,
            } => {
                assert_eq!(operation, "consume");
                assert_eq!(code, "consume_failed");
                assert_eq!(response_code, Some(BillingResponseCode::NetworkError));
                assert!(recoverable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
