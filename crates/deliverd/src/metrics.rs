use once_cell::sync::Lazy;
use prometheus::{IntCounter, IntGauge};

pub static CONNECTION_GAUGE: Lazy<IntGauge> = Lazy::new(|| {
    prometheus::register_int_gauge!("active_connection_count", "number of open outbound connections")
        .unwrap()
});

pub static TOTAL_CONNECTIONS: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "total_connection_count",
        "total number of outbound connections ever opened"
    )
    .unwrap()
});

pub static MSGS_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "total_messages_delivered",
        "recipients delivered successfully"
    )
    .unwrap()
});

pub static MSGS_TRANSFAIL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "total_messages_transfail",
        "recipients that failed transiently and will be retried"
    )
    .unwrap()
});

pub static MSGS_FAIL: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "total_messages_fail",
        "recipients that failed permanently"
    )
    .unwrap()
});

pub static DOMAIN_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!(
        "total_domain_errors",
        "destination-wide failures applied to pending recipients"
    )
    .unwrap()
});

pub static BATCHES_RUN: Lazy<IntCounter> = Lazy::new(|| {
    prometheus::register_int_counter!("total_batches_run", "delivery batches processed").unwrap()
});

pub(crate) fn count_disposition(status: &crate::queue::DeliveryStatus) {
    use crate::queue::Classification;
    match status.classification() {
        Classification::Success => MSGS_DELIVERED.inc(),
        Classification::Transient => MSGS_TRANSFAIL.inc(),
        Classification::Permanent => MSGS_FAIL.inc(),
    }
}
