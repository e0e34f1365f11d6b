//! UDP echo server over the uringnet proactor.
//!
//! ```text
//! uringnet-echo [port]
//! ```
//!
//! Binds a datagram socket on the given port (default 7007) and echoes
//! every datagram back to its sender. Drive it with e.g.
//! `socat - udp:127.0.0.1:7007`.

use std::process;
use std::sync::Arc;

use log::{error, info};

use uringnet_core::endpoint::{Endpoint, Transport};
use uringnet_core::options::{Data, ReceiveOptions, SendOptions};
use uringnet_proactor::{Proactor, ProactorConfig};
use uringnet_socket::{DatagramSocket, DatagramSocketOptions};

fn main() {
    env_logger::init();

    let port: u16 = std::env::args()
        .nth(1)
        .map(|arg| arg.parse().unwrap_or(7007))
        .unwrap_or(7007);

    let proactor = match Proactor::new(ProactorConfig::default()) {
        Ok(proactor) => proactor,
        Err(err) => {
            error!("proactor setup failed: {}", err);
            process::exit(1);
        }
    };

    let socket = DatagramSocket::create(Arc::clone(&proactor), DatagramSocketOptions::default());
    if let Err(err) = socket.open(Transport::UdpIpv4) {
        error!("open failed: {}", err);
        process::exit(1);
    }
    let endpoint = Endpoint::Ip(format!("0.0.0.0:{}", port).parse().unwrap());
    if let Err(err) = socket.bind(&endpoint) {
        error!("bind {} failed: {}", endpoint, err);
        process::exit(1);
    }

    info!("echoing on {}", socket.source_endpoint().unwrap());

    post_receive(&socket);

    let mut waiter = proactor.register_waiter();
    proactor.run(&mut waiter);
    proactor.deregister_waiter(waiter);
}

fn post_receive(socket: &Arc<DatagramSocket>) {
    let next = Arc::clone(socket);
    let result = socket.receive(
        &ReceiveOptions::default(),
        Box::new(move |result, blob, context| {
            match result {
                Ok(()) => {
                    let blob = blob.expect("successful receive carries a datagram");
                    if let Some(sender) = context.endpoint {
                        info!("{} bytes from {}", blob.len(), sender);
                        let reply = SendOptions {
                            endpoint: Some(sender),
                            ..Default::default()
                        };
                        if let Err(err) =
                            next.send(Data::Blob(Arc::new(blob)), &reply, None)
                        {
                            error!("echo send failed: {}", err);
                        }
                    }
                    post_receive(&next);
                }
                Err(err) => {
                    error!("receive failed: {}", err);
                }
            }
        }),
    );

    if let Err(err) = result {
        error!("receive post failed: {}", err);
    }
}
