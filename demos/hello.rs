//! Minimal server: answers every GET with a greeting, everything else 404.
//!
//! Run with `cargo run --example hello`, then `curl -v localhost:8082/hello`.

use snar::{Config, EventLoop, Method, Promise, Request, Response, Status};

fn route(request: &Request) -> Promise<Option<Response>> {
    let response = match request.method() {
        Method::Get => Some(
            Response::new(Status::Ok)
                .header("Content-Type", "text/plain")
                .body(format!("hello from {}\n", request.target())),
        ),
        _ => None,
    };
    Promise::resolved(Ok(response))
}

fn main() -> Result<(), snar::Error> {
    env_logger::init();

    let mut server = EventLoop::new(Config::default(), route)?;
    server.start()?;
    println!("listening on http://{}", server.local_addr());

    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        println!("{:?}", server.snapshot());
    }
}
