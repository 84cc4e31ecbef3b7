//! The demo application served by the `gantry` binary.

use bytes::Bytes;
use gantry_gateway::{
    EmptyResponseHandler, ErrorFormat, Gateway, HandlerChain, HandlerResult, HttpErrorHandler,
};
use gantry_protocol::{Body, HttpError, RequestContext, Response, upgrade_method};
use http::{Method, StatusCode};
use serde_json::json;
use tracing::{debug, info};

/// `GET /hello`, `POST /echo`, `GET /stream`, `GET /info` and an echo socket
/// at `/ws`. Anything else is a `404`.
pub fn gateway() -> Gateway {
    Gateway::builder()
        .request_fn(route)
        .response_handler(EmptyResponseHandler::default().with_body("Not Found"))
        .exception_handler(HttpErrorHandler::new(ErrorFormat::Json))
        .finalizer_fn(log_request)
        .build()
}

fn route(
    chain: &mut HandlerChain<'_, RequestContext>,
    context: &mut RequestContext,
    response: &mut Response,
) -> HandlerResult {
    let request = context.request();
    let method = request.method().clone();

    match request.path() {
        "/hello" => {
            require(&method, &Method::GET)?;
            chain.respond(response, StatusCode::OK, "Hello, world!\n");
        }
        "/echo" => {
            require(&method, &Method::POST)?;
            let body = request.body().clone();
            chain.respond(response, StatusCode::OK, body);
        }
        "/stream" => {
            require(&method, &Method::GET)?;
            let chunks = (1..=5).map(|i| Bytes::from(format!("chunk {i}\n")));
            chain.respond(response, StatusCode::OK, Body::stream(chunks));
        }
        "/info" => {
            require(&method, &Method::GET)?;
            response.set_json(&json!({
                "id": context.id().to_string(),
                "path": request.path(),
                "query": request.query(),
                "remote": request.remote_addr().map(|a| a.to_string()),
            }))?;
            response.set_status(StatusCode::OK);
            chain.stop();
        }
        "/ws" => {
            require(&method, &upgrade_method())?;
            echo(context)?;
            chain.stop();
        }
        _ => {}
    }
    Ok(())
}

fn require(method: &Method, expected: &Method) -> Result<(), HttpError> {
    if method == expected {
        Ok(())
    } else {
        Err(HttpError::method_not_allowed(method))
    }
}

fn echo(context: &RequestContext) -> HandlerResult {
    let Some(upgrade) = context.request().upgrade() else {
        return Err(HttpError::bad_request("expected a websocket upgrade").into());
    };

    let socket = upgrade.accept()?;
    for message in &socket {
        let message = message?;
        debug!("echo {} bytes", message.len());
        socket.send(message)?;
    }
    Ok(())
}

fn log_request(
    _chain: &mut HandlerChain<'_, RequestContext>,
    context: &mut RequestContext,
    response: &mut Response,
) -> HandlerResult {
    let request = context.request();
    let status = response
        .status()
        .map_or_else(|| "-".to_owned(), |s| s.as_u16().to_string());
    info!(
        "{} {} {} {:?}",
        request.method(),
        request.path(),
        status,
        context.created_at().elapsed()
    );
    Ok(())
}
