// Copyright 2024 The Bootlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use core::sync::atomic::{AtomicI32, Ordering};
use core::time::Duration;
use std::sync::{Arc, Mutex};

use bootlink_config::conductor::{ErrorCode, Retry};
use bootlink_error::{Code, Error, make_err};
use bootlink_macro::bootlink_test;
use bootlink_util::retry::{Retrier, RetryResult};
use futures::future::ready;
use futures::stream::repeat_with;
use pretty_assertions::assert_eq;

fn instant_retrier(config: Retry) -> Retrier {
    Retrier::new(
        Arc::new(|_duration| Box::pin(ready(()))),
        Arc::new(|delay| delay),
        config,
    )
}

#[bootlink_test]
async fn first_success_runs_once() -> Result<(), Error> {
    let retrier = instant_retrier(Retry {
        max_retries: 5,
        ..Default::default()
    });
    let run_count = AtomicI32::new(0);

    let result = retrier
        .retry(repeat_with(|| {
            run_count.fetch_add(1, Ordering::Relaxed);
            RetryResult::Ok("fetched")
        }))
        .await?;
    assert_eq!(run_count.load(Ordering::Relaxed), 1);
    assert_eq!(result, "fetched");
    Ok(())
}

#[bootlink_test]
async fn transient_errors_exhaust_retries() -> Result<(), Error> {
    let retrier = instant_retrier(Retry {
        max_retries: 2,
        ..Default::default()
    });
    let run_count = AtomicI32::new(0);

    let result = retrier
        .retry(repeat_with(|| {
            run_count.fetch_add(1, Ordering::Relaxed);
            RetryResult::<()>::Retry(make_err!(Code::Unavailable, "image service down"))
        }))
        .await;
    assert_eq!(run_count.load(Ordering::Relaxed), 3);
    assert_eq!(
        result.unwrap_err().to_string(),
        "Error { code: Unavailable, messages: [\"image service down\", \"On attempt 3\"] }"
    );
    Ok(())
}

#[bootlink_test]
async fn permanent_error_is_not_retried_by_default() -> Result<(), Error> {
    let retrier = instant_retrier(Retry {
        max_retries: 4,
        ..Default::default()
    });
    let run_count = AtomicI32::new(0);

    let result = retrier
        .retry(repeat_with(|| {
            run_count.fetch_add(1, Ordering::Relaxed);
            RetryResult::<()>::Retry(make_err!(Code::NotFound, "no such image"))
        }))
        .await;
    assert_eq!(run_count.load(Ordering::Relaxed), 1);
    assert_eq!(result.unwrap_err().code, Code::NotFound);
    Ok(())
}

#[bootlink_test]
async fn retry_on_errors_overrides_defaults() -> Result<(), Error> {
    let retrier = instant_retrier(Retry {
        max_retries: 3,
        retry_on_errors: Some(vec![ErrorCode::NotFound]),
        ..Default::default()
    });

    let run_count = AtomicI32::new(0);
    let result = retrier
        .retry(repeat_with(|| {
            if run_count.fetch_add(1, Ordering::Relaxed) == 1 {
                return RetryResult::Ok(true);
            }
            RetryResult::Retry(make_err!(Code::NotFound, "not replicated yet"))
        }))
        .await?;
    assert!(result);
    assert_eq!(run_count.load(Ordering::Relaxed), 2);

    // Codes outside the list are now permanent.
    let run_count = AtomicI32::new(0);
    let result = retrier
        .retry(repeat_with(|| {
            run_count.fetch_add(1, Ordering::Relaxed);
            RetryResult::<bool>::Retry(make_err!(Code::Unavailable, "down"))
        }))
        .await;
    assert!(result.is_err());
    assert_eq!(run_count.load(Ordering::Relaxed), 1);
    Ok(())
}

#[bootlink_test]
async fn err_result_stops_immediately() -> Result<(), Error> {
    let retrier = instant_retrier(Retry {
        max_retries: 3,
        ..Default::default()
    });
    let result = retrier
        .retry(repeat_with(|| {
            RetryResult::<()>::Err(make_err!(Code::Unavailable, "giving up"))
        }))
        .await;
    assert_eq!(
        result.unwrap_err().messages,
        vec!["giving up".to_string(), "On attempt 1".to_string()]
    );
    Ok(())
}

#[bootlink_test]
async fn sleep_durations_back_off_exponentially() -> Result<(), Error> {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let sleeps_clone = sleeps.clone();
    let retrier = Retrier::new(
        Arc::new(move |duration: Duration| {
            sleeps_clone.lock().unwrap().push(duration);
            Box::pin(ready(()))
        }),
        Arc::new(|delay| delay),
        Retry {
            max_retries: 3,
            delay: 0.1,
            ..Default::default()
        },
    );

    let result = retrier
        .retry(repeat_with(|| {
            RetryResult::<()>::Retry(make_err!(Code::Unavailable, "down"))
        }))
        .await;
    assert!(result.is_err());
    let sleeps = sleeps.lock().unwrap().clone();
    assert_eq!(sleeps.len(), 3);
    assert!(sleeps[0] < sleeps[1] && sleeps[1] < sleeps[2]);
    assert_eq!(sleeps[1], sleeps[0] * 2);
    Ok(())
}
