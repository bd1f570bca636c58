//! Request dispatch
//!
//! Bridges a parsed request to the router's asynchronous response and steers
//! the completion back onto the loop thread. The completion callback may run
//! on any thread the router chose, so it carries only the connection's stable
//! id; the loop re-finds the connection, which may have been evicted by then.

use log::error;

use crate::connection::ConnState;
use crate::event_loop::LoopState;
use crate::parser::{Request, Response, Status};
use crate::queue::{Promise, TaskResult};

/// Produces a response for a parsed request, possibly on another thread.
///
/// Resolving with `None` means no route matched and yields a `404`; a failed
/// promise yields a `500`. A response status of `400` or above forces the
/// connection closed regardless of the request's Keep-Alive wish.
pub trait Router: Send + 'static {
    /// Routes one request. The returned promise may complete from any thread;
    /// the core hops the result back to the loop before touching connection
    /// state.
    fn route(&self, request: &Request) -> Promise<Option<Response>>;
}

/// Closures double as routers, which keeps tests and small servers short.
impl<F> Router for F
where
    F: Fn(&Request) -> Promise<Option<Response>> + Send + 'static,
{
    fn route(&self, request: &Request) -> Promise<Option<Response>> {
        self(request)
    }
}

impl LoopState {
    /// Hands a freshly parsed request to the router. The connection sits in
    /// `ProcessingRequest` until the completion lands; inbound bytes keep
    /// accumulating unparsed meanwhile.
    pub(crate) fn dispatch(&mut self, token: usize, request: Request) {
        let Some(conn) = self.table.get_mut(token) else {
            return;
        };
        conn.set_state(ConnState::ProcessingRequest);
        let id = conn.id();

        let promise = self.router.route(&request);
        if let Some(conn) = self.table.get_mut(token) {
            conn.set_request(request);
        }

        let queue = self.queue.clone();
        promise.on_complete(move |result| {
            // any thread; loop state is only touched inside the queued step
            queue.execute_on_loop(move |state| state.complete_request(id, result));
        });
    }

    /// Loop-side completion: build the response, settle Keep-Alive against
    /// the status, frame it, and start writing. A no-op when the connection
    /// was evicted while the router worked.
    pub(crate) fn complete_request(&mut self, id: u64, result: TaskResult<Option<Response>>) {
        let Some((token, conn)) = self.table.find_by_id(id) else {
            return;
        };

        let response = match result {
            Ok(Some(response)) => response,
            Ok(None) => Response::error(Status::NotFound),
            Err(err) => {
                error!("handler failed for connection {id}: {err}");
                Response::error(Status::InternalServerError)
            }
        };

        let status = response.status();
        let requested_keep_alive = conn
            .take_request()
            .map(|request| request.keep_alive())
            .unwrap_or(false);
        let keep_alive = requested_keep_alive && !status.is_error();

        let raw = response.serialize(keep_alive);
        conn.set_response(raw, status, keep_alive);
        self.attempt_write(token);
    }
}
