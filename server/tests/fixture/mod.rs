//! A scripted in-library media worker good enough for signaling tests: it accepts every
//! control request with plausible data and emits the producer lifecycle notifications
//! (`producerclose`, `producerpause`, `producerresume`) to the consumers of a producer, the
//! way the real worker drives remote consumer state.

use rainstream_media::prelude::{EmbeddedWorkerFn, EmbeddedWorkerIo};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::io::FromRawFd;
use std::sync::Arc;

#[derive(Default)]
struct WorkerState {
    // producer id -> (transport id, paused)
    producers: HashMap<String, (String, bool)>,
    // consumer id -> producer id
    consumers: HashMap<String, String>,
    // transport id -> consumer ids
    transport_consumers: HashMap<String, Vec<String>>,
    // data producer id -> transport id
    data_producers: HashMap<String, String>,
    // data consumer id -> data producer id
    data_consumers: HashMap<String, String>,
}

impl WorkerState {
    fn consumers_of_producer(&self, producer_id: &str) -> Vec<String> {
        self.consumers
            .iter()
            .filter(|(_, candidate)| candidate.as_str() == producer_id)
            .map(|(consumer_id, _)| consumer_id.clone())
            .collect()
    }

    fn data_consumers_of_producer(&self, data_producer_id: &str) -> Vec<String> {
        self.data_consumers
            .iter()
            .filter(|(_, candidate)| candidate.as_str() == data_producer_id)
            .map(|(data_consumer_id, _)| data_consumer_id.clone())
            .collect()
    }
}

fn read_frame(reader: &mut File) -> Option<String> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).ok()?;
    let mut payload = vec![0u8; u32::from_le_bytes(len_bytes) as usize];
    reader.read_exact(&mut payload).ok()?;
    String::from_utf8(payload).ok()
}

fn write_frame(writer: &mut File, payload: &str) -> std::io::Result<()> {
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(payload.as_bytes())
}

fn respond(writer: &mut File, id: u64, data: Option<Value>) -> std::io::Result<()> {
    let response = match data {
        Some(data) => json!({ "id": id, "accepted": true, "data": data }),
        None => json!({ "id": id, "accepted": true }),
    };
    write_frame(writer, &response.to_string())
}

fn notify(writer: &mut File, target_id: &str, event: &str) -> std::io::Result<()> {
    let notification = json!({ "targetId": target_id, "event": event });
    write_frame(writer, &notification.to_string())
}

fn str_field(value: &Value, field: &str) -> String {
    value
        .get(field)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn producer_type(data: &Value) -> &'static str {
    let encodings = data
        .get("rtpParameters")
        .and_then(|rtp_parameters| rtp_parameters.get("encodings"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if encodings.len() > 1 {
        "simulcast"
    } else if encodings
        .first()
        .and_then(|encoding| encoding.get("scalabilityMode"))
        .is_some()
    {
        "svc"
    } else {
        "simple"
    }
}

fn webrtc_transport_data(data: &Value) -> Value {
    let sctp_parameters = if data.get("enableSctp").and_then(Value::as_bool) == Some(true) {
        let num_streams = data.get("numSctpStreams").cloned().unwrap_or(json!({}));
        json!({
            "port": 5000,
            "OS": num_streams.get("OS").and_then(Value::as_u64).unwrap_or(1024),
            "MIS": num_streams.get("MIS").and_then(Value::as_u64).unwrap_or(1024),
            "maxMessageSize": data.get("maxSctpMessageSize").and_then(Value::as_u64).unwrap_or(262144),
        })
    } else {
        Value::Null
    };

    let sctp_state = if sctp_parameters.is_null() {
        Value::Null
    } else {
        json!("new")
    };

    json!({
        "iceRole": "controlled",
        "iceParameters": {
            "usernameFragment": "ufrag",
            "password": "password",
            "iceLite": true,
        },
        "iceCandidates": [
            {
                "foundation": "udpcandidate",
                "ip": "127.0.0.1",
                "port": 40000,
                "priority": 1076302079u32,
                "protocol": "udp",
                "type": "host",
            },
        ],
        "dtlsParameters": {
            "role": "auto",
            "fingerprints": [
                { "algorithm": "sha-256", "value": "00:11:22:33" },
            ],
        },
        "sctpParameters": sctp_parameters,
        "sctpState": sctp_state,
    })
}

fn handle_request(
    state: &mut WorkerState,
    writer: &mut File,
    id: u64,
    method: &str,
    payload: &Value,
) -> std::io::Result<()> {
    let internal = payload.get("internal").cloned().unwrap_or(json!({}));
    let data = payload.get("data").cloned().unwrap_or(json!({}));

    match method {
        "worker.dump" => respond(
            writer,
            id,
            Some(json!({ "pid": std::process::id(), "routerIds": [] })),
        ),
        "router.createWebRtcTransport" => {
            respond(writer, id, Some(webrtc_transport_data(&data)))
        }
        "router.createPlainTransport" => respond(
            writer,
            id,
            Some(json!({
                "tuple": {
                    "localIp": "127.0.0.1",
                    "localPort": 40001,
                    "protocol": "udp",
                },
                "sctpParameters": null,
            })),
        ),
        "transport.connect" => respond(writer, id, Some(json!({ "dtlsLocalRole": "client" }))),
        "transport.restartIce" => respond(
            writer,
            id,
            Some(json!({
                "iceParameters": {
                    "usernameFragment": "ufrag2",
                    "password": "password2",
                    "iceLite": true,
                },
            })),
        ),
        "transport.produce" => {
            let producer_id = str_field(&internal, "producerId");
            let transport_id = str_field(&internal, "transportId");
            let paused = data.get("paused").and_then(Value::as_bool).unwrap_or(false);
            state.producers.insert(producer_id, (transport_id, paused));

            respond(writer, id, Some(json!({ "type": producer_type(&data) })))
        }
        "transport.consume" => {
            let consumer_id = str_field(&internal, "consumerId");
            let producer_id = str_field(&internal, "producerId");
            let transport_id = str_field(&internal, "transportId");
            let paused = data.get("paused").and_then(Value::as_bool).unwrap_or(false);

            let producer_paused = state
                .producers
                .get(&producer_id)
                .map(|(_, paused)| *paused)
                .unwrap_or(false);

            state.consumers.insert(consumer_id.clone(), producer_id);
            state
                .transport_consumers
                .entry(transport_id)
                .or_default()
                .push(consumer_id);

            respond(
                writer,
                id,
                Some(json!({
                    "paused": paused,
                    "producerPaused": producer_paused,
                    "score": { "score": 10, "producerScore": 10, "producerScores": [] },
                })),
            )
        }
        "transport.produceData" => {
            let data_producer_id = str_field(&internal, "dataProducerId");
            let transport_id = str_field(&internal, "transportId");
            state.data_producers.insert(data_producer_id, transport_id);

            respond(writer, id, None)
        }
        "transport.consumeData" => {
            let data_consumer_id = str_field(&internal, "dataConsumerId");
            let data_producer_id = str_field(&internal, "dataProducerId");
            state
                .data_consumers
                .insert(data_consumer_id, data_producer_id);

            respond(writer, id, None)
        }
        "producer.pause" => {
            let producer_id = str_field(&internal, "producerId");
            if let Some((_, paused)) = state.producers.get_mut(&producer_id) {
                *paused = true;
            }
            respond(writer, id, None)?;

            for consumer_id in state.consumers_of_producer(&producer_id) {
                notify(writer, &consumer_id, "producerpause")?;
            }
            Ok(())
        }
        "producer.resume" => {
            let producer_id = str_field(&internal, "producerId");
            if let Some((_, paused)) = state.producers.get_mut(&producer_id) {
                *paused = false;
            }
            respond(writer, id, None)?;

            for consumer_id in state.consumers_of_producer(&producer_id) {
                notify(writer, &consumer_id, "producerresume")?;
            }
            Ok(())
        }
        "producer.close" => {
            let producer_id = str_field(&internal, "producerId");
            state.producers.remove(&producer_id);
            respond(writer, id, None)?;

            for consumer_id in state.consumers_of_producer(&producer_id) {
                state.consumers.remove(&consumer_id);
                notify(writer, &consumer_id, "producerclose")?;
            }
            Ok(())
        }
        "consumer.close" => {
            let consumer_id = str_field(&internal, "consumerId");
            state.consumers.remove(&consumer_id);
            respond(writer, id, None)
        }
        "dataProducer.close" => {
            let data_producer_id = str_field(&internal, "dataProducerId");
            state.data_producers.remove(&data_producer_id);
            respond(writer, id, None)?;

            for data_consumer_id in state.data_consumers_of_producer(&data_producer_id) {
                state.data_consumers.remove(&data_consumer_id);
                notify(writer, &data_consumer_id, "dataproducerclose")?;
            }
            Ok(())
        }
        "dataConsumer.close" => {
            let data_consumer_id = str_field(&internal, "dataConsumerId");
            state.data_consumers.remove(&data_consumer_id);
            respond(writer, id, None)
        }
        "transport.close" => {
            let transport_id = str_field(&internal, "transportId");
            respond(writer, id, None)?;

            // Producers living on this transport close, which closes their consumers.
            let closed_producers = state
                .producers
                .iter()
                .filter(|(_, (candidate, _))| candidate == &transport_id)
                .map(|(producer_id, _)| producer_id.clone())
                .collect::<Vec<_>>();
            for producer_id in closed_producers {
                state.producers.remove(&producer_id);
                for consumer_id in state.consumers_of_producer(&producer_id) {
                    state.consumers.remove(&consumer_id);
                    notify(writer, &consumer_id, "producerclose")?;
                }
            }

            // Consumers living on this transport just disappear.
            for consumer_id in state
                .transport_consumers
                .remove(&transport_id)
                .unwrap_or_default()
            {
                state.consumers.remove(&consumer_id);
            }

            // Same for data producers.
            let closed_data_producers = state
                .data_producers
                .iter()
                .filter(|(_, candidate)| candidate == &&transport_id)
                .map(|(data_producer_id, _)| data_producer_id.clone())
                .collect::<Vec<_>>();
            for data_producer_id in closed_data_producers {
                state.data_producers.remove(&data_producer_id);
                for data_consumer_id in state.data_consumers_of_producer(&data_producer_id) {
                    state.data_consumers.remove(&data_consumer_id);
                    notify(writer, &data_consumer_id, "dataproducerclose")?;
                }
            }

            Ok(())
        }
        "transport.getStats" | "producer.getStats" | "consumer.getStats"
        | "dataProducer.getStats" | "dataConsumer.getStats" => {
            respond(writer, id, Some(json!([{ "timestamp": 1 }])))
        }
        "transport.dump" | "producer.dump" | "consumer.dump" | "router.dump" => {
            respond(writer, id, Some(json!({})))
        }
        // worker.createRouter, router.close, router.createAudioLevelObserver,
        // rtpObserver.*, consumer.pause/resume/..., transport.setMax*Bitrate, etc.
        _ => respond(writer, id, None),
    }
}

/// Build the embedded worker function handed to `WorkerManager::with_embedded_worker`.
pub fn scripted_worker() -> EmbeddedWorkerFn {
    Arc::new(|_args: Vec<String>, io: EmbeddedWorkerIo| {
        let mut reader = unsafe { File::from_raw_fd(io.channel_read_fd) };
        let mut writer = unsafe { File::from_raw_fd(io.channel_write_fd) };
        let _payload_reader = unsafe { File::from_raw_fd(io.payload_read_fd) };
        let _payload_writer = unsafe { File::from_raw_fd(io.payload_write_fd) };

        let mut state = WorkerState::default();

        while let Some(frame) = read_frame(&mut reader) {
            // "<id>:<method>:<handlerId>:<payload>"
            let mut parts = frame.splitn(4, ':');
            let id = match parts.next().and_then(|raw| raw.parse::<u64>().ok()) {
                Some(id) => id,
                None => return 1,
            };
            let method = parts.next().unwrap_or_default().to_string();
            let _handler_id = parts.next().unwrap_or_default();
            let payload = parts
                .next()
                .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
                .unwrap_or(Value::Null);

            if handle_request(&mut state, &mut writer, id, &method, &payload).is_err() {
                return 1;
            }
        }

        0
    })
}
