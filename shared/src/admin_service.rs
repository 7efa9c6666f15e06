use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;

/// Serves `/health` (always ok) and `/ready` (ok once `is_ready` returns true).
pub struct AdminService<F> {
    is_ready: F,
}

impl<F> AdminService<F>
where
    F: Fn() -> bool,
{
    pub fn new(is_ready: F) -> Self {
        Self { is_ready }
    }
}

fn make_response(status: StatusCode) -> Response<Full<Bytes>> {
    let body = match status {
        StatusCode::OK => Bytes::from("ok\n"),
        _ => Bytes::from(format!(
            "{}\n",
            status.canonical_reason().unwrap_or("error")
        )),
    };
    let mut res = Response::new(Full::new(body));
    *res.status_mut() = status;
    res
}

impl<F> Service<Request<Incoming>> for AdminService<F>
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let status = route(req.uri().path(), (self.is_ready)());
        Box::pin(async move { Ok(make_response(status)) })
    }
}

fn route(path: &str, is_ready: bool) -> StatusCode {
    match path {
        "/health" => StatusCode::OK,
        "/ready" => match is_ready {
            true => StatusCode::OK,
            false => StatusCode::SERVICE_UNAVAILABLE,
        },
        _ => StatusCode::NOT_FOUND,
    }
}
