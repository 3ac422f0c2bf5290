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

use std::io;

use bootlink_error::{Code, Error, ResultExt, make_err, make_input_err};
use pretty_assertions::assert_eq;
use serde::de::Error as DeError;

#[test]
fn test_serde_deserialization_error_custom() {
    let error = <Error as DeError>::custom("Deserialization failed due to corrupted data");
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(
        error.messages,
        vec!["Deserialization failed due to corrupted data".to_string()]
    );
}

#[test]
fn test_err_tip_appends_messages_in_order() {
    let result: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::NotFound, "gone"));
    let error = result
        .err_tip(|| "Failed to link master image")
        .err_tip(|| "While caching image for node")
        .unwrap_err();
    assert_eq!(error.code, Code::NotFound);
    assert_eq!(
        error.messages,
        vec![
            "gone".to_string(),
            "Failed to link master image".to_string(),
            "While caching image for node".to_string(),
        ]
    );
}

#[test]
fn test_err_tip_with_code_none() {
    let option: Option<i32> = None;
    let result: Result<i32, Error> =
        option.err_tip_with_code(|_error| (Code::InvalidArgument, "Missing value in option"));
    let error = result.unwrap_err();
    assert_eq!(error.code, Code::InvalidArgument);
    assert_eq!(error.messages, vec!["Missing value in option".to_string()]);
}

#[test]
fn test_err_tip_with_code_some() {
    let option = Some(42);
    let result: Result<i32, Error> =
        option.err_tip_with_code(|_error| (Code::Unknown, "Should not appear"));
    assert_eq!(result.unwrap(), 42);
}

#[test]
fn test_code_to_error_conversion() {
    let error: Error = Code::FailedPrecondition.into();
    assert_eq!(error.code, Code::FailedPrecondition);
    assert!(error.messages.is_empty());
}

#[test]
fn test_merge_keeps_both_message_stacks() {
    let first = make_err!(Code::Unavailable, "first");
    let second = make_input_err!("second");
    let merged = first.merge(second);
    assert_eq!(merged.code, Code::Unavailable);
    assert_eq!(
        merged.messages,
        vec!["first".to_string(), "---".to_string(), "second".to_string()]
    );
}

#[test]
fn test_io_error_kind_mapping() {
    let error: Error = io::Error::new(io::ErrorKind::AlreadyExists, "exists").into();
    assert_eq!(error.code, Code::AlreadyExists);
    let error: Error = io::Error::new(io::ErrorKind::PermissionDenied, "nope").into();
    assert_eq!(error.code, Code::PermissionDenied);
    let error: Error = io::Error::new(io::ErrorKind::StorageFull, "disk full").into();
    assert_eq!(error.code, Code::ResourceExhausted);
}

#[test]
fn test_root_message_ignores_tips() {
    let error = Err::<(), _>(make_err!(Code::Internal, "power driver timed out"))
        .err_tip(|| "Failed to power off node")
        .unwrap_err();
    assert_eq!(error.root_message(), "power driver timed out");
    assert_eq!(
        error.message_string(),
        "power driver timed out : Failed to power off node"
    );
    let error: Error = Code::Aborted.into();
    assert_eq!(error.root_message(), "");
}

#[test]
fn test_display_omits_empty_messages() {
    let error: Error = Code::Aborted.into();
    assert_eq!(error.to_string(), "Error { code: Aborted }");
    let error = make_err!(Code::Aborted, "locked");
    assert_eq!(
        error.to_string(),
        "Error { code: Aborted, messages: [\"locked\"] }"
    );
}

#[tokio::test]
async fn test_join_error_conversion() {
    let join_error = tokio::spawn(async { panic!("JoinError mock") })
        .await
        .unwrap_err();
    let error: Error = join_error.into();
    assert_eq!(error.code, Code::Internal);
    assert!(error.messages[0].contains("JoinError mock"));
}
