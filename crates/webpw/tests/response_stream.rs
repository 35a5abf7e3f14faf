//! Streaming encode results to a peer and reading them back.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use common::{Echo, FAILING_WIDTH, echo_codec, solid_rgba};
use webpw::{EncodeOptions, Server, Status, read_responses, write_response};

#[tokio::test]
async fn results_stream_as_json_lines_with_frames() {
    let server = Server::builder().with_binary(echo_codec()).build();
    server.start().unwrap();

    let requests = [
        (10, solid_rgba(4, 4, 1)),
        (11, solid_rgba(FAILING_WIDTH, 1, 1)),
        (12, solid_rgba(6, 2, 9)),
    ];

    let mut stream = Vec::new();
    for (id, bitmap) in &requests {
        let result = server
            .encode_to_vec(bitmap, &EncodeOptions::default())
            .await;
        write_response(&mut stream, *id, &result).await.unwrap();
    }
    server.close().await.unwrap();

    let responses = read_responses(stream.as_slice()).unwrap();
    assert_eq!(responses.len(), 3);

    let first = &responses[0];
    assert_eq!(first.record.header.id, 10);
    assert_eq!(first.record.header.status, Status::Ok);
    let data = first.record.data.unwrap();
    assert_eq!((data.width, data.height, data.length), (4, 4, 36));
    assert_eq!(Echo::parse(first.body.as_ref().unwrap()).width, 4);

    let failed = &responses[1];
    assert_eq!(failed.record.header.status, Status::Error);
    assert_eq!(failed.record.header.code, Some(5));
    assert!(failed.body.is_none());

    let third = &responses[2];
    assert_eq!(third.record.header.id, 12);
    assert_eq!(Echo::parse(third.body.as_ref().unwrap()).height, 2);
}
